use std::fmt::Write;

use crate::engine::Run;
use crate::registry::TaskRegistry;
use crate::task::Status;

const FILL_FAILED: &str = "#FF6B6B";
const FILL_SKIPPED: &str = "#D3D3D3";
const FILL_IDLE: &str = "#ADD8E6";

impl Run {
    /// Renders the run as a Mermaid diagram.
    ///
    /// * **Green → Yellow → Red**: finished, by duration relative to the
    ///   fastest and slowest task of the run
    /// * **Red**: failed
    /// * **Grey**: skipped because a dependency failed
    /// * **Blue**: did not take part in this run
    pub fn render_mermaid(&self, registry: &TaskRegistry) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let secs: Vec<f64> = self
            .timings
            .values()
            .map(|t| t.duration.as_secs_f64())
            .collect();
        let min_time = secs.iter().copied().fold(f64::MAX, f64::min);
        let mut max_time = secs.iter().copied().fold(f64::MIN, f64::max);

        // Avoid divide by zero if all tasks took the same time
        if secs.is_empty() || (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        for index in registry.graph.node_indices() {
            let task = &registry.graph[index];
            let name = task.name.replace('"', "\\\"");

            let (label, fill) = match (self.status(&task.name), self.execution(&task.name)) {
                (Some(Status::Done), Some(exec)) => {
                    let t = (exec.duration.as_secs_f64() - min_time) / (max_time - min_time);
                    (format!("{:.2?}", exec.duration), gradient(t))
                }
                (Some(Status::Failed), _) => ("failed".to_string(), FILL_FAILED.to_string()),
                (Some(Status::Skipped), _) => ("skipped".to_string(), FILL_SKIPPED.to_string()),
                _ => ("idle".to_string(), FILL_IDLE.to_string()),
            };

            let _ = writeln!(f, "    {}[\"{}\\n{}\"]", index.index(), name, label);
            let _ = writeln!(f, "    style {} fill:{}", index.index(), fill);
        }

        for edge in registry.graph.raw_edges() {
            let _ = writeln!(f, "    {} --> {}", edge.source().index(), edge.target().index());
        }

        f
    }
}

/// 0.0 (Green) -> 0.5 (Yellow) -> 1.0 (Red)
fn gradient(t: f64) -> String {
    let t = t.clamp(0.0, 1.0);
    let (r, g) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
    };

    format!("#{r:02X}{g:02X}00")
}
