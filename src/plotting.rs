use textplots::{Chart, Plot};

use crate::error::MxError;

/// Determine the best scale and unit for a time span in seconds
fn determine_scale(max_value: f64) -> (f64, &'static str) {
    if max_value >= 1.0 {
        (1.0, "")
    } else if max_value >= 1e-3 {
        (1e3, "m")
    } else if max_value >= 1e-6 {
        (1e6, "μ")
    } else {
        (1e9, "n")
    }
}

/// Turn `(time, level)` edges into a step-shaped line
///
/// Each level is held until the next edge; the last one is held until
/// `end`. Times are relative to the first edge.
pub fn step_frame(edges: &[(f64, f64)], end: f64) -> Vec<(f64, f64)> {
    let Some(&(origin, first)) = edges.first() else {
        return Vec::new();
    };

    let mut frame = Vec::with_capacity(edges.len() * 2 + 1);
    frame.push((0.0, first));
    let mut level = first;
    for &(at, value) in &edges[1..] {
        let t = at - origin;
        frame.push((t, level));
        frame.push((t, value));
        level = value;
    }
    frame.push(((end - origin).max(0.0), level));
    frame
}

/// Plot a recorded output waveform in the terminal
///
/// # Arguments
/// * `edges` - `(seconds, level)` pairs, oldest first
/// * `end` - Time to draw the final level up to
/// * `title` - Optional title for the plot
/// * `width` - Optional plot width (default: 140)
/// * `height` - Optional plot height (default: 30)
pub fn plot_waveform(
    edges: &[(f64, f64)],
    end: f64,
    title: Option<&str>,
    width: Option<usize>,
    height: Option<usize>,
) -> Result<(), MxError> {
    if edges.is_empty() {
        return Err(MxError::IllegalArgument(
            "Cannot plot a waveform without any transitions".to_string(),
        ));
    }

    let width = width.unwrap_or(140);
    let height = height.unwrap_or(30);

    let frame = step_frame(edges, end);
    let span = frame.last().map(|&(t, _)| t).unwrap_or(0.0);
    let (time_scale, time_unit) = determine_scale(span);

    let points: Vec<(f32, f32)> = frame
        .iter()
        .map(|&(t, level)| ((t * time_scale) as f32, level as f32))
        .collect();
    let x_max = ((span * time_scale) as f32).max(1.0);

    println!("{}", title.unwrap_or("Output Waveform"));
    println!("X-axis: Time ({}s) | Y-axis: Level", time_unit);
    println!(
        "{} transitions over {:.3} {}s",
        edges.len(),
        span * time_scale,
        time_unit
    );
    println!("{}", "─".repeat(width));

    Chart::new_with_y_range(width as u32, height as u32, 0.0, x_max, -0.1, 1.1)
        .lineplot(&textplots::Shape::Lines(&points))
        .nice();

    println!("Time →");

    Ok(())
}
