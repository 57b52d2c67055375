pub mod callpoint;
pub mod controller;
pub mod error;
pub mod mock_physical;
pub mod physical;
pub mod quotaholder_api;

// Re-export the main types for convenience
pub use callpoint::{
    callpoint_constructor, callpoint_names, CallSignature, Callpoint, CallpointConstructor,
    ControlledCallpoint, ValueSchema,
};
pub use controller::{Advance, Controller, CONTROLLER_REASON};
pub use error::ControllerError;
pub use mock_physical::{MockDescription, MockPhysical, MockState, PhysicalCall};
pub use physical::{CommissionSpec, Physical};
pub use quotaholder_api::QuotaholderCallpoint;
