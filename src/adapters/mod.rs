//! Backend adapters (Roon, LMS, OpenHome, UPnP, HQPlayer).

pub mod hqplayer;
pub mod lms;
pub mod openhome;
pub mod roon;
pub mod traits;
pub mod upnp;

pub use traits::{Backend, Capabilities, ControlCommand};
