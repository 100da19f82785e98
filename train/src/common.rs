//! Common imports from external crates.

pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use approx::{abs_diff_eq, assert_abs_diff_eq};
pub use chrono::{DateTime, Local};
pub use futures::future::{self, FutureExt as _, TryFutureExt as _};
pub use hdetr::{
    batch::{Batch, NestedTensor, Target},
    distributed::{self, LocalGroup, ProcessGroup, SingleProcess},
    evaluator::{
        DetectionDumper, DetectionEvaluator, IouType, PanopticEvaluator, PanopticRecord,
        PanopticSummary, PqStats,
    },
    loss::{
        self, Criterion, HybridLoss, HybridLossInit, JitCriterion, LossDict, WeightDict,
        CLASS_ERROR,
    },
    metric::{MeterFormat, MetricLogger, SmoothedValue},
    model::{Detector, DetectorOutput, JitDetector, JitDetectorInit, QueryConfig, QueryConfigGuard},
    postprocess::{Detections, PostProcessors, TopKPostProcess, TopKPostProcessInit},
    precision::{
        self, FullPrecision, GradScalerInit, MixedPrecision, PrecisionPolicy,
    },
    profiling::Timing,
};
pub use indexmap::{IndexMap, IndexSet};
pub use itertools::{izip, Itertools};
pub use noisy_float::prelude::*;
pub use rand::{prelude::*, rngs::StdRng, seq::SliceRandom};
pub use regex::Regex;
pub use serde::{Deserialize, Deserializer, Serialize, Serializer};
pub use std::{
    borrow::Borrow,
    collections::{HashMap, HashSet},
    fmt::Debug,
    fs,
    io::{self, BufRead, BufReader, Write as _},
    iter, mem,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
pub use structopt::StructOpt;
pub use tch::{
    kind::FLOAT_CPU,
    nn::{self, OptimizerConfig as _},
    vision, Device, IndexOp, Kind, Tensor,
};
pub use tch_tensor_like::TensorLike;
pub use tfrecord::{EventWriter, EventWriterInit};
pub use tracing::{error, info, info_span, warn};

pub type Fallible<T> = Result<T, Error>;
