//! Services the pipeline depends on but does not own.

mod consent;
mod identity;
mod upscale;

pub use consent::{ConsentLedger, ConsentRecord, JsonlConsentLedger, MemoryConsentLedger};
pub use identity::{FixedImage, IdentityFixer};
pub use upscale::{LanczosUpscaler, UpscaleOutput, Upscaler};
