//! Audio side of the camera link: resampling, PCM conversion, playback scheduling, capture
//! and the `/audio` session that ties them to the event channel.

pub mod capture;
pub mod config;
pub mod device;
pub mod pcm;
pub mod playback;
pub mod resample;
pub mod session;
