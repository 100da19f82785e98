//! Smoothed scalar statistics and progress logging.

use crate::{common::*, distributed::ProcessGroup};

pub use log_every::*;
pub use metric_logger::*;
pub use smoothed_value::*;

mod smoothed_value {
    use super::*;

    /// How a meter renders itself in progress lines.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum MeterFormat {
        /// `median (global_avg)`
        MedianGlobalAvg { precision: usize },
        /// the latest value only
        Value { precision: usize },
    }

    /// Tracks a series of values with a sliding window and a global average.
    #[derive(Debug, Clone)]
    pub struct SmoothedValue {
        window: VecDeque<f64>,
        window_size: usize,
        total: f64,
        count: u64,
        format: MeterFormat,
    }

    impl Default for SmoothedValue {
        fn default() -> Self {
            Self::new(20, MeterFormat::MedianGlobalAvg { precision: 4 })
        }
    }

    impl SmoothedValue {
        pub fn new(window_size: usize, format: MeterFormat) -> Self {
            let window_size = window_size.max(1);
            Self {
                window: VecDeque::with_capacity(window_size),
                window_size,
                total: 0.0,
                count: 0,
                format,
            }
        }

        /// Shows only the latest value with the given decimal places.
        pub fn latest(precision: usize) -> Self {
            Self::new(1, MeterFormat::Value { precision })
        }

        /// Records `value` observed `n` times.
        pub fn update(&mut self, value: f64, n: u64) {
            if self.window.len() == self.window_size {
                self.window.pop_front();
            }
            self.window.push_back(value);
            self.count += n;
            self.total += value * n as f64;
        }

        /// Sums the count and the total over all workers.
        ///
        /// The window is kept local.
        pub fn synchronize_between_processes(&mut self, group: &dyn ProcessGroup) -> Result<()> {
            let reduced = group.all_reduce_f64(&[self.count as f64, self.total])?;
            self.count = reduced[0] as u64;
            self.total = reduced[1];
            Ok(())
        }

        pub(super) fn state(&self) -> [f64; 2] {
            [self.count as f64, self.total]
        }

        pub(super) fn set_state(&mut self, [count, total]: [f64; 2]) {
            self.count = count as u64;
            self.total = total;
        }

        pub fn count(&self) -> u64 {
            self.count
        }

        pub fn total(&self) -> f64 {
            self.total
        }

        /// The median of the window. Even-sized windows take the lower middle.
        pub fn median(&self) -> f64 {
            if self.window.is_empty() {
                return f64::NAN;
            }
            let mut values: Vec<f64> = self.window.iter().cloned().collect();
            values.sort_by(|lhs, rhs| lhs.total_cmp(rhs));
            values[(values.len() - 1) / 2]
        }

        pub fn avg(&self) -> f64 {
            self.window.iter().sum::<f64>() / self.window.len() as f64
        }

        /// NaN before the first update.
        pub fn global_avg(&self) -> f64 {
            self.total / self.count as f64
        }

        pub fn max(&self) -> f64 {
            self.window.iter().cloned().fold(f64::NAN, f64::max)
        }

        pub fn value(&self) -> f64 {
            self.window.back().cloned().unwrap_or(f64::NAN)
        }
    }

    impl fmt::Display for SmoothedValue {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self.format {
                MeterFormat::MedianGlobalAvg { precision } => write!(
                    f,
                    "{:.*} ({:.*})",
                    precision,
                    self.median(),
                    precision,
                    self.global_avg()
                ),
                MeterFormat::Value { precision } => write!(f, "{:.*}", precision, self.value()),
            }
        }
    }
}

mod metric_logger {
    use super::*;

    /// A named collection of [SmoothedValue]s.
    ///
    /// Meters are updated through a shared reference so that a
    /// [LogEvery] iterator can render them while the loop body is updating.
    #[derive(Debug)]
    pub struct MetricLogger {
        meters: RefCell<IndexMap<String, SmoothedValue>>,
        delimiter: String,
    }

    impl Default for MetricLogger {
        fn default() -> Self {
            Self::new("  ")
        }
    }

    impl MetricLogger {
        pub fn new(delimiter: impl Into<String>) -> Self {
            Self {
                meters: RefCell::new(IndexMap::new()),
                delimiter: delimiter.into(),
            }
        }

        pub fn add_meter(&self, name: impl Into<String>, meter: SmoothedValue) {
            self.meters.borrow_mut().insert(name.into(), meter);
        }

        pub fn update(&self, name: &str, value: f64) {
            self.update_with_count(name, value, 1);
        }

        pub fn update_with_count(&self, name: &str, value: f64, n: u64) {
            let mut meters = self.meters.borrow_mut();
            match meters.get_mut(name) {
                Some(meter) => meter.update(value, n),
                None => {
                    let mut meter = SmoothedValue::default();
                    meter.update(value, n);
                    meters.insert(name.to_string(), meter);
                }
            }
        }

        pub fn update_many<'a, I>(&self, values: I)
        where
            I: IntoIterator<Item = (&'a String, &'a f64)>,
        {
            values
                .into_iter()
                .for_each(|(name, &value)| self.update(name, value));
        }

        pub fn meter(&self, name: &str) -> Option<SmoothedValue> {
            self.meters.borrow().get(name).cloned()
        }

        /// Merges the counts and totals of every meter over all workers.
        ///
        /// Meters are reduced in sorted-name order within a single collective,
        /// so all workers must hold the same set of meters.
        pub fn synchronize_between_processes(&self, group: &dyn ProcessGroup) -> Result<()> {
            let mut meters = self.meters.borrow_mut();
            let mut names: Vec<String> = meters.keys().cloned().collect();
            names.sort();

            let flat: Vec<f64> = names
                .iter()
                .flat_map(|name| meters[name.as_str()].state())
                .collect();
            let reduced = group.all_reduce_f64(&flat)?;
            ensure!(
                reduced.len() == flat.len(),
                "workers hold different sets of meters"
            );

            izip!(&names, reduced.chunks(2)).for_each(|(name, state)| {
                meters[name.as_str()].set_state([state[0], state[1]]);
            });
            Ok(())
        }

        /// The global average of every meter.
        pub fn global_averages(&self) -> IndexMap<String, f64> {
            self.meters
                .borrow()
                .iter()
                .map(|(name, meter)| (name.clone(), meter.global_avg()))
                .collect()
        }

        /// Wraps `iterable` with periodic progress lines.
        pub fn log_every<I>(
            &self,
            iterable: I,
            print_freq: usize,
            header: impl Into<String>,
        ) -> LogEvery<'_, I::IntoIter>
        where
            I: IntoIterator,
            I::IntoIter: ExactSizeIterator,
        {
            LogEvery::new(self, iterable.into_iter(), print_freq, header.into())
        }
    }

    impl fmt::Display for MetricLogger {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let text = self
                .meters
                .borrow()
                .iter()
                .map(|(name, meter)| format!("{}: {}", name, meter))
                .join(&self.delimiter);
            f.write_str(&text)
        }
    }
}

mod log_every {
    use super::*;

    /// The iterator returned by [MetricLogger::log_every].
    ///
    /// It is single-pass. A progress line is printed every `print_freq`
    /// items and after the last item, and the total time once the wrapped
    /// iterator is exhausted or the wrapper is dropped.
    #[derive(Debug)]
    pub struct LogEvery<'a, I> {
        logger: &'a MetricLogger,
        inner: I,
        print_freq: usize,
        header: String,
        total: usize,
        index: usize,
        start: Option<Instant>,
        end: Instant,
        iter_time: SmoothedValue,
        data_time: SmoothedValue,
        finished: bool,
    }

    impl<'a, I> LogEvery<'a, I>
    where
        I: ExactSizeIterator,
    {
        pub(super) fn new(
            logger: &'a MetricLogger,
            inner: I,
            print_freq: usize,
            header: String,
        ) -> Self {
            let total = inner.len();
            let format = MeterFormat::MedianGlobalAvg { precision: 4 };
            Self {
                logger,
                inner,
                print_freq: print_freq.max(1),
                header,
                total,
                index: 0,
                start: None,
                end: Instant::now(),
                iter_time: SmoothedValue::new(20, format),
                data_time: SmoothedValue::new(20, format),
                finished: false,
            }
        }

        fn report_progress(&self, index: usize) {
            let eta = self.iter_time.global_avg() * (self.total.saturating_sub(index)) as f64;
            let width = self.total.to_string().len();
            info!(
                "{} [{:>width$}/{}]  eta: {}  {}  time: {}  data: {}",
                self.header,
                index,
                self.total,
                format_secs(eta),
                self.logger,
                self.iter_time,
                self.data_time,
                width = width
            );
        }

        fn report_total(&self) {
            if let Some(start) = self.start {
                let total_time = start.elapsed().as_secs_f64();
                info!(
                    "{} Total time: {} ({:.4} s / it)",
                    self.header,
                    format_secs(total_time),
                    total_time / self.total.max(1) as f64
                );
            }
        }
    }

    impl<'a, I> Iterator for LogEvery<'a, I>
    where
        I: ExactSizeIterator,
    {
        type Item = I::Item;

        fn next(&mut self) -> Option<Self::Item> {
            if self.finished {
                return None;
            }

            let now = Instant::now();
            if self.start.is_none() {
                self.start = Some(now);
                self.end = now;
            }

            // account for the item handed out in the previous call
            if self.index > 0 {
                self.iter_time.update(self.end.elapsed().as_secs_f64(), 1);
                let last = self.index - 1;
                if last % self.print_freq == 0 || last + 1 == self.total {
                    self.report_progress(last);
                }
                self.end = Instant::now();
            }

            match self.inner.next() {
                Some(item) => {
                    self.data_time.update(self.end.elapsed().as_secs_f64(), 1);
                    self.index += 1;
                    Some(item)
                }
                None => {
                    self.finished = true;
                    self.report_total();
                    None
                }
            }
        }

        fn size_hint(&self) -> (usize, Option<usize>) {
            self.inner.size_hint()
        }
    }

    impl<'a, I> Drop for LogEvery<'a, I> {
        fn drop(&mut self) {
            if !self.finished {
                if let Some(start) = self.start {
                    let total_time = start.elapsed().as_secs_f64();
                    info!(
                        "{} Total time: {} ({:.4} s / it)",
                        self.header,
                        format_secs(total_time),
                        total_time / self.index.max(1) as f64
                    );
                }
            }
        }
    }

    /// Formats seconds as `H:MM:SS`.
    pub fn format_secs(secs: f64) -> String {
        if !secs.is_finite() {
            return "-:--:--".into();
        }
        let secs = secs.max(0.0) as u64;
        format!("{}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{LocalGroup, SingleProcess};
    use std::thread;

    #[test]
    fn smoothed_value_window_and_global_average() {
        let mut meter = SmoothedValue::new(3, MeterFormat::MedianGlobalAvg { precision: 2 });
        [1.0, 5.0, 2.0, 4.0].iter().for_each(|&value| meter.update(value, 1));

        assert_abs_diff_eq!(meter.median(), 4.0);
        assert_abs_diff_eq!(meter.avg(), 11.0 / 3.0);
        assert_abs_diff_eq!(meter.max(), 5.0);
        assert_abs_diff_eq!(meter.value(), 4.0);
        assert_abs_diff_eq!(meter.global_avg(), 3.0);
        assert_eq!(format!("{}", meter), "4.00 (3.00)");
    }

    #[test]
    fn weighted_update_counts_observations() {
        let mut meter = SmoothedValue::default();
        meter.update(2.0, 10);
        assert_eq!(meter.count(), 10);
        assert_abs_diff_eq!(meter.total(), 20.0);
    }

    #[test]
    fn synchronization_merges_counts_and_sums() {
        let groups = LocalGroup::new(2).unwrap();
        let averages: Vec<f64> = thread::scope(|scope| {
            let handles: Vec<_> = groups
                .into_iter()
                .map(|group| {
                    scope.spawn(move || {
                        let logger = MetricLogger::default();
                        if group.rank() == 0 {
                            logger.update_with_count("loss", 2.0, 10);
                        } else {
                            logger.update_with_count("loss", 1.0, 5);
                        }
                        logger.synchronize_between_processes(&group).unwrap();
                        logger.global_averages()["loss"]
                    })
                })
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).collect()
        });

        averages
            .iter()
            .for_each(|&avg| assert_abs_diff_eq!(avg, 25.0 / 15.0, epsilon = 1e-9));
    }

    #[test]
    fn log_every_yields_every_item_once() {
        let logger = MetricLogger::default();
        let mut seen = vec![];
        for index in logger.log_every(0..7, 3, "Test:") {
            logger.update("value", index as f64);
            seen.push(index);
        }
        assert_eq!(seen, (0..7).collect::<Vec<_>>());
        assert_abs_diff_eq!(logger.global_averages()["value"], 3.0);

        logger.synchronize_between_processes(&SingleProcess).unwrap();
        assert_abs_diff_eq!(logger.global_averages()["value"], 3.0);
    }

    #[test]
    fn format_secs_as_clock() {
        assert_eq!(format_secs(3725.7), "1:02:05");
        assert_eq!(format_secs(f64::NAN), "-:--:--");
    }
}
