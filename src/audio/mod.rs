pub mod buffer;
pub mod decode;
pub mod device;
pub mod playback;
pub mod processing;
pub mod slot;
pub mod timeline;

pub use buffer::AudioBuffer;
pub use decode::{decode_bytes, decode_payload, DecodeOptions};
pub use device::{AudioDevice, DeviceState, GainStage, SimulatedDevice, Voice};
pub use playback::PlaybackSession;
pub use slot::PlayerSlot;
