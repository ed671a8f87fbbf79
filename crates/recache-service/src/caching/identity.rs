use std::collections::BTreeMap;
use std::fmt;

use super::normalize::ArgValue;

/// How a wrapped function relates to a receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// A free function or static method; all positional arguments participate in the key.
    Free,
    /// An instance method; the leading positional argument is the receiver.
    Method,
    /// A class-level method; the leading positional argument is the type itself.
    ClassMethod,
}

/// The stable identity of a wrapped function.
///
/// Computed once when a function is registered for caching, never re-derived per call. Two
/// registrations with the same module path and qualified name share cache entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionIdentity {
    module_path: String,
    qualified_name: String,
    kind: FunctionKind,
}

impl FunctionIdentity {
    pub fn new(
        module_path: impl Into<String>,
        qualified_name: impl Into<String>,
        kind: FunctionKind,
    ) -> Self {
        Self {
            module_path: module_path.into(),
            qualified_name: qualified_name.into(),
            kind,
        }
    }

    /// Identity of a free function.
    pub fn free(module_path: impl Into<String>, qualified_name: impl Into<String>) -> Self {
        Self::new(module_path, qualified_name, FunctionKind::Free)
    }

    /// Identity of an instance method.
    pub fn method(module_path: impl Into<String>, qualified_name: impl Into<String>) -> Self {
        Self::new(module_path, qualified_name, FunctionKind::Method)
    }

    pub fn kind(&self) -> FunctionKind {
        self.kind
    }

    /// The `{module}.{qualified_name}` path used inside cache keys.
    pub fn function_path(&self) -> String {
        format!("{}.{}", self.module_path, self.qualified_name)
    }

    /// Whether calls carry a leading receiver argument that must not participate in the key.
    pub fn has_receiver(&self) -> bool {
        !matches!(self.kind, FunctionKind::Free)
    }
}

impl fmt::Display for FunctionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module_path, self.qualified_name)
    }
}

/// Captures a [`FunctionIdentity`] for a free function at the registration site.
#[macro_export]
macro_rules! function_identity {
    ($name:expr) => {
        $crate::caching::FunctionIdentity::free(module_path!(), $name)
    };
}

/// The arguments of one call to a wrapped function.
///
/// Keyword arguments are kept sorted by name; positional order is preserved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArguments {
    args: Vec<ArgValue>,
    kwargs: BTreeMap<String, ArgValue>,
}

impl CallArguments {
    pub fn new(args: Vec<ArgValue>) -> Self {
        Self {
            args,
            kwargs: BTreeMap::new(),
        }
    }

    pub fn with_kwarg(mut self, name: impl Into<String>, value: ArgValue) -> Self {
        self.kwargs.insert(name.into(), value);
        self
    }

    pub fn args(&self) -> &[ArgValue] {
        &self.args
    }

    pub fn kwargs(&self) -> &BTreeMap<String, ArgValue> {
        &self.kwargs
    }

    /// The positional arguments that participate in key derivation.
    ///
    /// For methods the leading receiver argument is dropped, so instances of the same type share
    /// cache entries when the remaining arguments are equal.
    pub(crate) fn filtered_args(&self, identity: &FunctionIdentity) -> &[ArgValue] {
        if identity.has_receiver() && !self.args.is_empty() {
            &self.args[1..]
        } else {
            &self.args
        }
    }
}

impl From<Vec<ArgValue>> for CallArguments {
    fn from(args: Vec<ArgValue>) -> Self {
        Self::new(args)
    }
}
