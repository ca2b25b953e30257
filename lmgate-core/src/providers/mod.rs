pub mod dummy;
pub mod lmstudio;

pub use dummy::Dummy;
pub use lmstudio::LmStudio;
