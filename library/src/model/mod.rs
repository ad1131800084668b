pub mod hierarchy;
pub mod options;
pub mod point;
pub mod value;

pub use hierarchy::ModelHierarchy;
pub use options::{OptionError, Options, RunOptions};
pub use point::ParameterPoint;
pub use value::Value;
