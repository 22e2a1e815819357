pub mod background;
pub mod grayscale;
pub mod morphology;
pub mod threshold;

pub use background::{ema_step, BackgroundMode, BackgroundSubtract};
pub use grayscale::Grayscale;
pub use morphology::{MorphOp, Morphology};
pub use threshold::{AdaptiveThreshold, ThresholdMode};
