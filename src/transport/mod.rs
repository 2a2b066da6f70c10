//! Host/firmware link: physical links, transfer frames, packets and the
//! controller task running the transfer cycle.

pub mod binary_code;
pub mod firmware;
pub mod frame;
pub mod link;
pub mod packets;

pub use firmware::{
    ControllerContext, FirmwareCommand, FirmwareController, FirmwareError, FirmwareEvent, FirmwareHandle, command_channel,
};
pub use frame::{Frame, FrameError, Framer};
pub use link::{Link, MemoryLink, SerialLink};
pub use packets::{DecodeError, EncodeError, FirmwareRequest, HostRequest, PrintPausedReason, PrintStartedInfo, PrintStoppedReason};
