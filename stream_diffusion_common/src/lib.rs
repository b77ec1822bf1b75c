mod model_source;
mod progress;
mod tokens;

pub use model_source::{FileLoader, ModelSource};
pub use progress::NiceProgressBar;
pub use tokens::{get_token, TokenSource};
