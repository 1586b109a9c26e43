//! Capture module for frames and location
//!
//! - Frame throttling and fixed-quality JPEG compression (`sampler`)
//! - Location tracking and sources: gpsd, static, push-style (`location`)
//! - Frame sources: synthetic test pattern and push-style (`source`)
//! - Accepted-frame rate estimate for status displays (`rate`)

pub mod location;
pub mod rate;
pub mod sampler;
pub mod source;

pub use location::{
    GpsdLocationSource, LocationEvent, LocationSource, LocationTracker, StaticLocationSource,
};
pub use rate::FrameRateTracker;
pub use sampler::{FrameCompressor, JpegCompressor, Sampler, SamplerConfig, SamplerStats, Throttle};
pub use source::{
    ChannelFrameSource, ChannelLocationSource, ChannelSource, FrameSource, Pusher,
    TestFrameSource, TestSourceConfig,
};
