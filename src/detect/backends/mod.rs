pub mod cascade;
pub mod stub;
pub mod yolo;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use cascade::{CascadeBackend, CascadeParams, HaarCascade};
pub use stub::StubBackend;
pub use yolo::{decode_rows, ClassLabels};

#[cfg(feature = "backend-tract")]
pub use tract::TractYoloBackend;
