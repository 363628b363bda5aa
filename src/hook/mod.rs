pub mod installer;
pub mod interceptor;

use std::fmt;

pub use installer::{run_site, DetourInstaller, HookError, HookInstaller, InstalledHook};
pub use interceptor::{Arguments, Interceptor, RequestCapture, ResponseCapture, FORWARDED_ARGS};

/// The two methods the agent intercepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookTarget {
    /// Exit hook; the return value is the decompressed response body
    DecompressResponse,
    /// Entry hook; an argument is the uncompressed request body
    CompressRequest,
}

impl HookTarget {
    pub const COUNT: usize = 2;

    pub const ALL: [HookTarget; HookTarget::COUNT] =
        [HookTarget::DecompressResponse, HookTarget::CompressRequest];

    pub fn index(self) -> usize {
        match self {
            HookTarget::DecompressResponse => 0,
            HookTarget::CompressRequest => 1,
        }
    }

    /// Managed method name looked up on the helper class
    pub fn method_name(self) -> &'static str {
        match self {
            HookTarget::DecompressResponse => "DecompressResponse",
            HookTarget::CompressRequest => "CompressRequest",
        }
    }
}

impl fmt::Display for HookTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method_name())
    }
}
