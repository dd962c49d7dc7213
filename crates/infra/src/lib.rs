//! eq8comp infrastructure: storage backends and the virtual audio substrate

pub mod audio;
pub mod storage;
