pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use approx::{abs_diff_eq, assert_abs_diff_eq};
pub use dashmap::DashSet;
pub use indexmap::{IndexMap, IndexSet};
pub use itertools::{chain, izip, Itertools as _};
pub use lazy_static::lazy_static;
pub use log::{error, info, warn};
pub use noisy_float::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    any::Any,
    borrow::{Borrow, Cow},
    cell::RefCell,
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    fmt::Debug,
    iter,
    mem,
    ops::{Deref, DerefMut},
    path::{Path, PathBuf},
    sync::{Arc, Barrier, Mutex, MutexGuard},
    time::{Duration, Instant},
};
pub use tch::{
    kind::{FLOAT_CPU, INT64_CPU},
    nn::{self, OptimizerConfig},
    Device, IndexOp, Kind, Reduction, Tensor,
};
pub use tch_tensor_like::TensorLike;
