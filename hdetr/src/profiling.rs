//! Step timing that compiles away without the `profiling` feature.

use crate::common::*;

lazy_static! {
    static ref PROFILING_CONFIG: ProfilingConfig = {
        #[cfg(feature = "profiling")]
        {
            match envy::prefixed("HDETR_").from_env() {
                Ok(config) => config,
                Err(err) => {
                    warn!(
                        "failed to load profiling environment variables, fallback to default values: {:?}",
                        err
                    );
                    ProfilingConfig::default()
                }
            }
        }

        #[cfg(not(feature = "profiling"))]
        ProfilingConfig::default()
    };
    static ref REGISTERED_TIMINGS: DashSet<&'static str> = DashSet::new();
}

/// Read from `HDETR_PROFILING_WHITELIST`, a comma separated list of timing
/// names allowed to report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilingConfig {
    pub profiling_whitelist: Option<HashSet<String>>,
}

#[cfg(feature = "profiling")]
#[derive(Debug)]
pub struct Timing {
    name: &'static str,
    instant: Instant,
    elapsed: Vec<(&'static str, Duration)>,
}

#[cfg(not(feature = "profiling"))]
#[derive(Debug)]
pub struct Timing;

impl Timing {
    pub fn new(name: &'static str) -> Self {
        #[cfg(feature = "profiling")]
        {
            if REGISTERED_TIMINGS.insert(name) {
                info!("registered timing profile '{}'", name);
            }

            Self {
                name,
                instant: Instant::now(),
                elapsed: vec![],
            }
        }

        #[cfg(not(feature = "profiling"))]
        {
            let _ = name;
            Self
        }
    }

    /// Records the time since the previous record under `name`.
    pub fn set_record(&mut self, name: &'static str) {
        #[cfg(feature = "profiling")]
        {
            self.elapsed.push((name, self.instant.elapsed()));
            self.instant = Instant::now();
        }

        #[cfg(not(feature = "profiling"))]
        let _ = name;
    }

    pub fn report(&self) {
        #[cfg(feature = "profiling")]
        {
            if is_whitelisted(self.name) {
                let total: Duration = self.elapsed.iter().map(|(_, elapsed)| *elapsed).sum();
                info!("profiling report for '{}' ({:?} total)", self.name, total);
                self.elapsed.iter().for_each(|(name, elapsed)| {
                    info!("- {}\t{:?}", name, elapsed);
                });
            }
        }
    }
}

/// Returns true if the timing `name` passes the whitelist.
pub fn is_whitelisted(name: &str) -> bool {
    PROFILING_CONFIG
        .profiling_whitelist
        .as_ref()
        .map(|whitelist| whitelist.contains(name))
        .unwrap_or(true)
}
