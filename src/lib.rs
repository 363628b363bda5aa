//! Network capture for IL2CPP games
//!
//! Built as a `cdylib`, this crate is the agent loaded into the game: it
//! hooks the game's HTTP body compression helpers, snapshots the plain
//! MessagePack bodies and forwards them to the controller. The
//! `netcap-controller` binary built from the same crate receives, decodes and
//! stores them.

pub mod backend;
pub mod channel;
pub mod config;
pub mod controller;
pub mod envelope;
pub mod hook;
pub mod il2cpp;
pub mod logging;
pub mod session;
pub mod sink;

#[cfg(feature = "status-server")]
pub mod status;

#[cfg(test)]
mod testing;

use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

pub use backend::{ExtractError, ResolveError};
pub use channel::frame::FrameError;
pub use channel::TransportError;
pub use config::{AgentConfig, ConfigError, ControllerConfig};
pub use envelope::{DecodeError, DecodedEnvelope, EnvelopeDecoder};
pub use hook::HookError;
pub use session::Session;
pub use sink::SinkError;

#[derive(Debug, Error)]
pub enum NetcapError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Hook(#[from] HookError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

static SESSION: Mutex<Option<Session>> = Mutex::new(None);

fn session_slot() -> MutexGuard<'static, Option<Session>> {
    SESSION.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn attach() -> i32 {
    let mut slot = session_slot();
    if let Some(session) = slot.as_ref() {
        return session.installed().len() as i32;
    }

    if let Some(path) = logging::init_agent() {
        tracing::info!(log = %path.display(), "agent loaded");
    }
    let config = match AgentConfig::load() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, "bad agent config, not attaching");
            return 0;
        }
    };

    let session = Session::attach(&config);
    let installed = session.installed().len() as i32;
    if session.is_active() {
        *slot = Some(session);
    }
    installed
}

/// Attach to the running IL2CPP runtime
///
/// Returns the number of hooks installed, `0` when nothing could be set up,
/// or `-1` after an internal panic. Calling it again while attached is a no-op.
#[no_mangle]
pub extern "C" fn netcap_attach() -> i32 {
    std::panic::catch_unwind(attach).unwrap_or(-1)
}

/// Remove the hooks and stop forwarding
#[no_mangle]
pub extern "C" fn netcap_detach() {
    let _ = std::panic::catch_unwind(|| {
        if let Some(session) = session_slot().take() {
            session.detach();
        }
    });
}

#[cfg(target_os = "windows")]
#[no_mangle]
#[allow(non_snake_case)]
pub extern "system" fn DllMain(
    _module: winapi::shared::minwindef::HINSTANCE,
    reason: winapi::shared::minwindef::DWORD,
    _reserved: winapi::shared::minwindef::LPVOID,
) -> winapi::shared::minwindef::BOOL {
    // The loader lock is held here; attaching has to happen elsewhere
    if reason == winapi::um::winnt::DLL_PROCESS_ATTACH {
        let _ = std::thread::Builder::new()
            .name("netcap-attach".to_string())
            .spawn(|| {
                netcap_attach();
            });
    }
    winapi::shared::minwindef::TRUE
}
