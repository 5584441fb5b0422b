//! Error types for the live patching engine
//!
//! Every error maps to the negative errno the kernel interface would
//! return, see [`KlpError::errno`].

use core::fmt;

/// Result type for live patching operations
pub type KlpResult<T> = Result<T, KlpError>;

/// Errors that can occur while registering, enabling or driving a patch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KlpError {
    /// Malformed patch, object or function description; nothing installed
    Validation(ValidationError),

    /// Symbol or relocation resolution failed
    Symbol(SymbolError),

    /// Another patch is in transition
    AlreadyInTransition,

    /// A pre-patch callback refused the object (callback's return code)
    CallbackRejected(i32),

    /// Companion patch module failed to load
    ModuleLoad(i32),

    /// The target module, or the module carrying the object, is not loaded
    TargetModuleNotLoaded(String),

    /// The patch is not allowed to touch this object
    ObjectNotAllowed(String),

    /// An object with this name is already attached to the patch
    DuplicateObject(String),

    /// A patch with this name is already registered
    DuplicatePatch(String),

    /// No registered patch with this name
    PatchNotFound(String),

    /// A disabled patch cannot be enabled again
    ReEnableNotAllowed,

    /// Request does not apply in the current state
    InvalidRequest(&'static str),

    /// System state versions conflict with installed patches
    IncompatiblePatch(String),

    /// The platform cannot apply the relocations (host return code)
    RelocationFailed(i32),

    /// Function-entry hook could not be (un)registered (host return code)
    TraceRegistration(i32),

    /// The consistency model is required but not available
    Unsupported,
}

impl KlpError {
    /// Negative errno equivalent
    pub fn errno(&self) -> i32 {
        match self {
            KlpError::Validation(_) => -libc::EINVAL,
            KlpError::Symbol(e) => e.errno(),
            KlpError::AlreadyInTransition => -libc::EBUSY,
            KlpError::CallbackRejected(code)
            | KlpError::ModuleLoad(code)
            | KlpError::RelocationFailed(code)
            | KlpError::TraceRegistration(code) => normalize(*code),
            KlpError::TargetModuleNotLoaded(_) => -libc::ENODEV,
            KlpError::ObjectNotAllowed(_) => -libc::EINVAL,
            KlpError::DuplicateObject(_) | KlpError::DuplicatePatch(_) => -libc::EEXIST,
            KlpError::PatchNotFound(_) => -libc::EINVAL,
            KlpError::ReEnableNotAllowed => -libc::EINVAL,
            KlpError::InvalidRequest(_) => -libc::EINVAL,
            KlpError::IncompatiblePatch(_) => -libc::EINVAL,
            KlpError::Unsupported => -libc::EOPNOTSUPP,
        }
    }
}

// Host codes may come in either sign; a positive modprobe exit code means EINVAL.
fn normalize(code: i32) -> i32 {
    match code {
        0 => -libc::EINVAL,
        c if c < 0 => c,
        1 => -libc::EINVAL,
        c => -c,
    }
}

impl fmt::Display for KlpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KlpError::Validation(e) => write!(f, "invalid patch: {}", e),
            KlpError::Symbol(e) => write!(f, "symbol error: {}", e),
            KlpError::AlreadyInTransition => write!(f, "another patch is in transition"),
            KlpError::CallbackRejected(code) => write!(f, "pre-patch callback failed ({})", code),
            KlpError::ModuleLoad(code) => write!(f, "module load failed ({})", code),
            KlpError::TargetModuleNotLoaded(m) => write!(f, "module '{}' is not loaded", m),
            KlpError::ObjectNotAllowed(o) => write!(f, "patch may not touch object '{}'", o),
            KlpError::DuplicateObject(o) => write!(f, "object '{}' already attached", o),
            KlpError::DuplicatePatch(p) => write!(f, "patch '{}' already registered", p),
            KlpError::PatchNotFound(p) => write!(f, "patch '{}' not found", p),
            KlpError::ReEnableNotAllowed => write!(f, "disabled patch cannot be re-enabled"),
            KlpError::InvalidRequest(why) => write!(f, "invalid request: {}", why),
            KlpError::IncompatiblePatch(p) => {
                write!(f, "patch '{}' is not compatible with installed patches", p)
            }
            KlpError::RelocationFailed(code) => write!(f, "relocation failed ({})", code),
            KlpError::TraceRegistration(code) => write!(f, "trace hook registration failed ({})", code),
            KlpError::Unsupported => write!(f, "reliable stack traces unavailable"),
        }
    }
}

impl std::error::Error for KlpError {}

/// Description errors, detected before anything is installed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Object carries no patch name
    MissingPatchName,

    /// Patch name does not fit a module name
    PatchNameTooLong,

    /// Carrier module is not marked as a livepatch module
    NotLivepatchModule(String),

    /// Module object without a target name
    MissingObjectName,

    /// Target name does not fit a module name
    ObjectNameTooLong,

    /// Base image object with a name
    NamedBaseObject,

    /// Object without functions
    NoFunctions,

    /// Carrier module name differs from the expected `<patch>[__<object>]`
    CarrierMismatch { expected: String, found: String },

    /// Function without an old name
    MissingFuncName,

    /// Non-nop function without a replacement address
    MissingNewFunc(String),

    /// Function name does not fit a symbol name
    FuncNameTooLong,

    /// Patch with an empty object allow-list
    EmptyAllowList,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::MissingPatchName => write!(f, "patch name not set"),
            ValidationError::PatchNameTooLong => write!(f, "patch name too long"),
            ValidationError::NotLivepatchModule(m) => {
                write!(f, "module {} is not marked as a livepatch module", m)
            }
            ValidationError::MissingObjectName => write!(f, "object name not set"),
            ValidationError::ObjectNameTooLong => write!(f, "object name too long"),
            ValidationError::NamedBaseObject => write!(f, "vmlinux object must not have a name"),
            ValidationError::NoFunctions => write!(f, "object has no functions"),
            ValidationError::CarrierMismatch { expected, found } => {
                write!(f, "module name {} does not match, expected {}", found, expected)
            }
            ValidationError::MissingFuncName => write!(f, "function old name not set"),
            ValidationError::MissingNewFunc(name) => write!(f, "no new function for '{}'", name),
            ValidationError::FuncNameTooLong => write!(f, "function name too long"),
            ValidationError::EmptyAllowList => write!(f, "empty object allow-list"),
        }
    }
}

impl From<ValidationError> for KlpError {
    fn from(e: ValidationError) -> Self {
        KlpError::Validation(e)
    }
}

/// Symbol resolution errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolError {
    /// No symbol with this name in the object
    NotFound { name: String },

    /// Several symbols match and no position was given
    Ambiguous { name: String, object: String },

    /// Fewer occurrences than the requested position
    PositionNotFound { name: String, object: String, pos: u64 },

    /// Relocation section or symbol name does not follow the livepatch format
    InvalidRelocationFormat(String),

    /// Symbol size could not be determined
    SizeLookup { name: String },
}

impl SymbolError {
    pub fn errno(&self) -> i32 {
        match self {
            SymbolError::SizeLookup { .. } => -libc::ENOENT,
            _ => -libc::EINVAL,
        }
    }
}

impl fmt::Display for SymbolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymbolError::NotFound { name } => {
                write!(f, "symbol '{}' not found in symbol table", name)
            }
            SymbolError::Ambiguous { name, object } => {
                write!(f, "unresolvable ambiguity for symbol '{}' in object '{}'", name, object)
            }
            SymbolError::PositionNotFound { name, object, pos } => write!(
                f,
                "symbol position {} for symbol '{}' in object '{}' not found",
                pos, name, object
            ),
            SymbolError::InvalidRelocationFormat(name) => {
                write!(f, "{} has an incorrectly formatted name", name)
            }
            SymbolError::SizeLookup { name } => write!(f, "size lookup failed for '{}'", name),
        }
    }
}

impl From<SymbolError> for KlpError {
    fn from(e: SymbolError) -> Self {
        KlpError::Symbol(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(KlpError::AlreadyInTransition.errno(), -libc::EBUSY);
        assert_eq!(KlpError::TargetModuleNotLoaded("m".into()).errno(), -libc::ENODEV);
        assert_eq!(KlpError::DuplicateObject("m".into()).errno(), -libc::EEXIST);
        assert_eq!(KlpError::from(ValidationError::NoFunctions).errno(), -libc::EINVAL);
        assert_eq!(
            KlpError::from(SymbolError::SizeLookup { name: "f".into() }).errno(),
            -libc::ENOENT
        );
    }

    #[test]
    fn test_host_codes_normalized() {
        assert_eq!(KlpError::ModuleLoad(1).errno(), -libc::EINVAL);
        assert_eq!(KlpError::ModuleLoad(-libc::ENOENT).errno(), -libc::ENOENT);
        assert_eq!(KlpError::CallbackRejected(libc::EPERM).errno(), -libc::EPERM);
    }

    #[test]
    fn test_display() {
        let e = KlpError::from(SymbolError::Ambiguous {
            name: "foo".into(),
            object: "vmlinux".into(),
        });
        assert_eq!(
            e.to_string(),
            "symbol error: unresolvable ambiguity for symbol 'foo' in object 'vmlinux'"
        );
    }
}
