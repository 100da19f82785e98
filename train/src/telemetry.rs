//! Optional scalar telemetry.

use crate::common::*;
use std::{fs::File, io::BufWriter};

/// A sink for flat scalar dictionaries.
pub trait TelemetrySink {
    fn log_scalars(&mut self, step: i64, scalars: &IndexMap<String, f64>) -> Result<()>;
}

/// Sends scalars to `sink`. Failures are reported and then ignored.
pub fn log_best_effort(
    sink: &mut dyn TelemetrySink,
    step: i64,
    scalars: &IndexMap<String, f64>,
) {
    if let Err(err) = sink.log_scalars(step, scalars) {
        warn!("failed to write telemetry at step {}: {:?}", step, err);
    }
}

/// Writes scalars to TensorBoard event files.
pub struct EventSink {
    tag_prefix: String,
    event_writer: EventWriter<BufWriter<File>>,
}

impl Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("tag_prefix", &self.tag_prefix)
            .finish()
    }
}

impl EventSink {
    pub fn new(event_dir: &Path, tag_prefix: impl Into<String>) -> Result<Self> {
        fs::create_dir_all(event_dir)?;
        let event_path_prefix = event_dir
            .join("hdetr")
            .into_os_string()
            .into_string()
            .map_err(|path| format_err!("non-unicode path {:?}", path))?;
        let event_writer = EventWriterInit::default().from_prefix(event_path_prefix, None)?;

        Ok(Self {
            tag_prefix: tag_prefix.into(),
            event_writer,
        })
    }
}

impl TelemetrySink for EventSink {
    fn log_scalars(&mut self, step: i64, scalars: &IndexMap<String, f64>) -> Result<()> {
        scalars.iter().try_for_each(|(name, &value)| -> Result<()> {
            self.event_writer.write_scalar(
                format!("{}/{}", self.tag_prefix, name),
                step,
                value as f32,
            )?;
            Ok(())
        })?;
        self.event_writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenSink;

    impl TelemetrySink for BrokenSink {
        fn log_scalars(&mut self, _step: i64, _scalars: &IndexMap<String, f64>) -> Result<()> {
            bail!("unreachable collector")
        }
    }

    #[test]
    fn best_effort_swallows_failures() {
        let scalars: IndexMap<String, f64> = [("loss".to_string(), 1.0)].into_iter().collect();
        log_best_effort(&mut BrokenSink, 0, &scalars);
    }

    #[test]
    fn event_sink_writes_files() -> Result<()> {
        let event_dir = std::env::temp_dir().join("hdetr-telemetry-test");
        let mut sink = EventSink::new(&event_dir, "train")?;
        let scalars: IndexMap<String, f64> = [("loss".to_string(), 1.0)].into_iter().collect();
        sink.log_scalars(0, &scalars)?;
        assert!(fs::read_dir(&event_dir)?.next().is_some());
        Ok(())
    }
}
