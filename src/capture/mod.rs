pub mod acquisition;
pub mod export;
pub mod frame;
pub mod normalize;
pub mod session;
pub mod single_shot;

pub use acquisition::{
    AcquisitionController, AcquisitionEvent, AcquisitionOptions, AcquisitionState, StopReport,
    SubscriptionId,
};
pub use frame::{BitDepth, FrameMetadata, NormalizedFrame};
pub use session::DeviceSession;
