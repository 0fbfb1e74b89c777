//! Hardware knob support: device registry and LCD image conversion.

pub mod image;
pub mod store;

pub use store::{
    KnobConfig, KnobConfigPatch, KnobRecord, KnobRegistry, KnobStatus, KnobStatusPatch,
    KnobSummary,
};
