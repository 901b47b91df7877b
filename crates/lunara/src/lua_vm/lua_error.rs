// Lightweight error enum: the error object itself is parked in the VM
// (vm.error_object) so Results stay one machine word.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// A Lua error was raised; the object is in `vm.error_object`. The
    /// dispatcher's unwind machinery consumes this.
    Raised,
    /// An error escaped the root coroutine with no protected frame; the
    /// object is in `vm.error_object`. The embedder decides what to do
    /// (the CLI prints it and exits 1).
    UncaughtError,
}

pub type VmResult<T> = Result<T, VmError>;

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmError::Raised => write!(f, "runtime error"),
            VmError::UncaughtError => write!(f, "uncaught error"),
        }
    }
}

impl std::error::Error for VmError {}

/// Load-time failure of a bytecode-JSON module.
#[derive(Debug)]
pub struct ModuleLoadError {
    pub message: String,
}

impl ModuleLoadError {
    pub fn new(message: impl Into<String>) -> ModuleLoadError {
        ModuleLoadError { message: message.into() }
    }
}

impl std::fmt::Display for ModuleLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "module load error: {}", self.message)
    }
}

impl std::error::Error for ModuleLoadError {}
