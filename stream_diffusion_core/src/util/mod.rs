mod dtype;

pub use dtype::{ModelDType, TryIntoDType};
