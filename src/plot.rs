//! Two-panel SVG of the per-class training distributions.

use std::path::PathBuf;

use jetstream::histogram::Histogram1D;
use plotters::coord::Shift;
use plotters::prelude::*;
use thiserror::Error;
use tracing::info;

use crate::training::DiagnosticHistograms;

#[derive(Debug, Error)]
pub enum PlotError {
    #[error(transparent)]
    Draw(#[from] DrawingAreaErrorKind<std::io::Error>),

    #[error("nothing to draw: no class has any entries")]
    Empty,

    #[error("{classes} classes but {names} names and {colors} colours")]
    Style {
        classes: usize,
        names: usize,
        colors: usize,
    },
}

/// Render configuration, passed explicitly to [`render_diagnostics`].
#[derive(Debug, Clone)]
pub struct RenderStyle {
    pub width: u32,
    pub height: u32,
    pub class_names: Vec<String>,
    pub colors: Vec<(u8, u8, u8)>,
    pub output: PathBuf,
}

impl Default for RenderStyle {
    fn default() -> Self {
        Self {
            width: 800,
            height: 750,
            class_names: ["b jet", "c jet", "uds jet", "g jet", "LLP jet"]
                .map(String::from)
                .to_vec(),
            colors: vec![
                (90, 140, 230),
                (255, 120, 30),
                (150, 70, 220),
                (60, 200, 60),
                (150, 150, 150),
            ],
            output: PathBuf::from("pipeline.svg"),
        }
    }
}

impl RenderStyle {
    /// Keep the first `num_classes` names and colours.
    pub fn for_classes(mut self, num_classes: usize) -> Self {
        self.class_names.truncate(num_classes);
        self.colors.truncate(num_classes);
        self
    }
}

/// Draw pT (top) and decay length (bottom), one step curve per class.
pub fn render_diagnostics(hists: &DiagnosticHistograms, style: &RenderStyle) -> Result<(), PlotError> {
    let classes = hists.num_classes();
    if style.class_names.len() < classes || style.colors.len() < classes {
        return Err(PlotError::Style {
            classes,
            names: style.class_names.len(),
            colors: style.colors.len(),
        });
    }
    if hists.pt.iter().all(|h| h.integral() == 0.0) {
        return Err(PlotError::Empty);
    }

    let root = SVGBackend::new(&style.output, (style.width, style.height)).into_drawing_area();
    root.fill(&WHITE)?;
    let panels = root.split_evenly((2, 1));

    draw_panel(&panels[0], &hists.pt, style, "log10(pT / 1 GeV)")?;
    draw_panel(&panels[1], &hists.decay, style, "log10(c tau / 1 mm)")?;

    root.present()?;
    info!("Wrote {}", style.output.display());
    Ok(())
}

fn draw_panel(
    area: &DrawingArea<SVGBackend<'_>, Shift>,
    hists: &[Histogram1D],
    style: &RenderStyle,
    x_desc: &str,
) -> Result<(), PlotError> {
    let Some(first) = hists.first() else {
        return Ok(());
    };
    let axis = first.axis;
    let y_max = hists.iter().map(Histogram1D::max).fold(0.0, f64::max).max(1.0) * 1.1;

    let mut chart = ChartBuilder::on(area)
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(axis.lo..axis.hi, 0.0..y_max)?;

    chart
        .configure_mesh()
        .x_desc(x_desc)
        .y_desc("Resampled jets")
        .draw()?;

    for (i, hist) in hists.iter().enumerate() {
        let (r, g, b) = style.colors[i];
        let color = RGBColor(r, g, b);
        chart
            .draw_series(LineSeries::new(step_points(hist), color.stroke_width(2)))?
            .label(style.class_names[i].as_str())
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
    }

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;
    Ok(())
}

/// Outline of the inner bins as a staircase starting and ending at zero.
fn step_points(hist: &Histogram1D) -> Vec<(f64, f64)> {
    let edges = hist.axis.edges();
    let mut points = Vec::with_capacity(2 * edges.len());
    points.push((edges[0], 0.0));
    for (i, &content) in hist.contents().iter().enumerate() {
        points.push((edges[i], content));
        points.push((edges[i + 1], content));
    }
    points.push((edges[edges.len() - 1], 0.0));
    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::DIAG_PT_AXIS;

    #[test]
    fn test_step_points_trace_bins() {
        let mut h = Histogram1D::new(DIAG_PT_AXIS);
        h.fill(1.35);
        h.fill(1.35);
        let pts = step_points(&h);
        assert_eq!(pts.len(), 2 * 10 + 2);
        assert_eq!(pts[0], (1.3, 0.0));
        assert_eq!(pts[1], (1.3, 2.0));
        assert_eq!(pts[2].1, 2.0);
        assert_eq!(pts[3].1, 0.0);
        assert_eq!(pts.last().map(|p| p.1), Some(0.0));
    }

    #[test]
    fn test_render_writes_svg() {
        let dir = tempfile::tempdir().unwrap();
        let mut hists = DiagnosticHistograms::new(4);
        for (c, (pt, decay)) in [(1.5, 0.0), (2.0, 1.0), (2.5, 3.0), (1.8, -1.0)].iter().enumerate() {
            for _ in 0..=c {
                hists.pt[c].fill(*pt);
                hists.decay[c].fill(*decay);
            }
        }
        let style = RenderStyle {
            output: dir.path().join("pipeline.svg"),
            ..Default::default()
        }
        .for_classes(4);
        render_diagnostics(&hists, &style).unwrap();

        let svg = std::fs::read_to_string(&style.output).unwrap();
        assert!(svg.contains("<svg"));
        assert!(svg.contains("uds jet"));
    }

    #[test]
    fn test_render_rejects_empty_and_short_style() {
        let dir = tempfile::tempdir().unwrap();
        let style = RenderStyle {
            output: dir.path().join("x.svg"),
            ..Default::default()
        };
        assert!(matches!(
            render_diagnostics(&DiagnosticHistograms::new(3), &style),
            Err(PlotError::Empty)
        ));
        assert!(matches!(
            render_diagnostics(&DiagnosticHistograms::new(6), &style),
            Err(PlotError::Style { classes: 6, .. })
        ));
        assert!(!style.output.exists());
    }
}
