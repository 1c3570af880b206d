use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod histogram;
pub mod pipeline;
pub mod record;
pub mod resampler;
pub mod schema;
pub mod selection;
pub mod source;
pub mod store;
pub mod weights;
