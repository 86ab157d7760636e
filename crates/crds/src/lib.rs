//! Gantry CRD Definitions
//!
//! Custom resources managed by the Gantry ingress controller, plus the
//! foreign kinds it reads.

pub mod certificate;
pub mod conversion;
pub mod ingress;
pub mod service_monitor;

pub use certificate::*;
pub use conversion::{ConversionError, ORIGIN_ANNOTATION, NATIVE_ORIGIN};
pub use ingress::*;
pub use service_monitor::*;

/// API group of the Gantry kinds.
pub const GROUP: &str = "gantry.dev";
