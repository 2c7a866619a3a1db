pub mod claims;
pub mod handoff;
pub mod validator;

pub use claims::{extract_claims, Claim, ClaimKind};
pub use handoff::{evaluate_handoff, HandoffDecision};
pub use validator::{validate_response, GroundingReport};
