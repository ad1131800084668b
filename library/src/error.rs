use thiserror::Error;

/// Formats a requester chain as ` (required by a <- b <- request)`.
fn chain_suffix(chain: &[String]) -> String {
    if chain.is_empty() {
        String::new()
    } else {
        format!(" (required by {})", chain.join(" <- "))
    }
}

fn type_suffix(type_name: &Option<String>) -> String {
    match type_name {
        Some(t) => format!(" of type `{t}`"),
        None => String::new(),
    }
}

fn excluded_suffix(excluded: &[String]) -> String {
    if excluded.is_empty() {
        String::new()
    } else {
        format!("; excluded: {}", excluded.join("; "))
    }
}

fn list(items: &[String]) -> String {
    items.join(", ")
}

#[derive(Error, Debug)]
pub enum LibraryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Libloading error: {0}")]
    Libloading(#[from] libloading::Error),
    #[error("Plugin error: {0}")]
    Plugin(String),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Graph build error: {0}")]
    Build(#[from] BuildError),
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("Fatal error in `{node}`: {message}")]
    Fatal { node: String, message: String },
    #[error("`{0}` is not an output of this graph")]
    UnknownOutput(String),
    #[error("graph was built for model `{graph}` but the point belongs to `{point}`")]
    ModelMismatch { graph: String, point: String },
}

impl LibraryError {
    pub fn fatal(node: impl Into<String>, message: impl Into<String>) -> Self {
        LibraryError::Fatal {
            node: node.into(),
            message: message.into(),
        }
    }
}

/// Malformed registration metadata. Raised immediately by the registries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("`{node}` has an empty {field}")]
    EmptyField { node: String, field: &'static str },
    #[error("a provider named `{0}` is already registered")]
    DuplicateNode(String),
    #[error("unknown model `{0}`")]
    UnknownModel(String),
    #[error("model `{0}` is already declared")]
    DuplicateModel(String),
    #[error("invalid loop specification on `{node}`: {reason}")]
    InvalidLoopSpec { node: String, reason: String },
}

/// Errors that make graph construction fail. None of them is ever defaulted away.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error(
        "no provider for capability `{capability}`{}{}{}",
        type_suffix(.type_name),
        chain_suffix(.chain),
        excluded_suffix(.excluded)
    )]
    MissingProvider {
        capability: String,
        type_name: Option<String>,
        chain: Vec<String>,
        excluded: Vec<String>,
    },
    #[error(
        "capability `{capability}` is ambiguous between [{}]{}; pin one of them",
        list(.candidates),
        chain_suffix(.chain)
    )]
    AmbiguousProvider {
        capability: String,
        candidates: Vec<String>,
        chain: Vec<String>,
    },
    #[error(
        "pinned provider `{pin}` for `{capability}` is unavailable: {reason}{}",
        chain_suffix(.chain)
    )]
    PinnedProviderUnavailable {
        capability: String,
        pin: String,
        reason: String,
        chain: Vec<String>,
    },
    #[error("dependency cycle: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },
    #[error(
        "`{capability}` was resolved to `{node}` of type `{found}`, but `{expected}` is required{}",
        chain_suffix(.chain)
    )]
    TypeMismatch {
        capability: String,
        node: String,
        expected: String,
        found: String,
        chain: Vec<String>,
    },
    #[error(
        "backend requirement `{group}` of `{node}` cannot be satisfied: {reason}{}",
        chain_suffix(.chain)
    )]
    UnsatisfiedBackend {
        node: String,
        group: String,
        reason: String,
        chain: Vec<String>,
    },
    #[error(
        "backend requirement `{group}` of `{node}` is provided by several backends [{}]; \
         pin a backend via `backend_pins`{}",
        list(.candidates),
        chain_suffix(.chain)
    )]
    AmbiguousBackend {
        node: String,
        group: String,
        candidates: Vec<String>,
        chain: Vec<String>,
    },
    #[error("`{node}` requires option `{key}`{}", chain_suffix(.chain))]
    MissingOption {
        node: String,
        key: String,
        chain: Vec<String>,
    },
    #[error("option `{key}` of `{node}` is invalid: {message}{}", chain_suffix(.chain))]
    InvalidOption {
        node: String,
        key: String,
        message: String,
        chain: Vec<String>,
    },
    #[error("model `{0}` is not declared in the model hierarchy")]
    IncompatibleModel(String),
    #[error(
        "`{node}` resolves the loop manager for `{member}` but does not manage a loop{}",
        chain_suffix(.chain)
    )]
    NotALoopManager {
        node: String,
        member: String,
        chain: Vec<String>,
    },
    #[error(
        "`{consumer}` depends on `{member}`, which only exists inside the loop managed by \
         `{manager}`"
    )]
    LoopBoundary {
        consumer: String,
        member: String,
        manager: String,
    },
    #[error(
        "loop `{manager}` reads `{capability}` from `{node}`, which is not a member of its loop"
    )]
    ConvergenceNotInRegion {
        manager: String,
        capability: String,
        node: String,
    },
}

/// Backend requirement resolution failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("no loaded backend provides `{group}`: {reason}")]
    Unsatisfiable { group: String, reason: String },
    #[error("`{group}` is provided by several backends [{}]; pin one of them", list(.candidates))]
    Ambiguous {
        group: String,
        candidates: Vec<String>,
    },
    #[error("invalid version `{0}`")]
    InvalidVersion(String),
    #[error("backend `{0}` is not loaded")]
    NotLoaded(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_provider_message_names_capability_and_chain() {
        let err = BuildError::MissingProvider {
            capability: "RD_oh2".to_string(),
            type_name: Some("double".to_string()),
            chain: vec!["likelihoods::lnL_oh2".to_string(), "<request>".to_string()],
            excluded: vec![],
        };
        let message = err.to_string();
        assert!(message.contains("`RD_oh2`"));
        assert!(message.contains("of type `double`"));
        assert!(message.contains("likelihoods::lnL_oh2 <- <request>"));
        assert!(!message.contains("excluded"));
    }

    #[test]
    fn cycle_message_lists_path() {
        let err = BuildError::Cycle {
            path: vec!["m::a".into(), "m::b".into(), "m::a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle: m::a -> m::b -> m::a");
    }
}
