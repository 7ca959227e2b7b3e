//! Hands a URL to the desktop browser.

use std::io;
use std::process::{Command, Stdio};

/// Something that can show a URL to the user.
pub trait BrowserOpener: Send + Sync {
    /// Opens `url`. Failure is reported but never fatal to the caller.
    fn open(&self, url: &str) -> io::Result<()>;
}

/// Opens URLs with the platform launcher (`xdg-open`, `open`, `start`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl BrowserOpener for SystemBrowser {
    fn open(&self, url: &str) -> io::Result<()> {
        let mut command = launcher(url);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // Launchers return immediately; the child is left to the OS.
        command.spawn().map(|_| ())
    }
}

#[cfg(target_os = "macos")]
fn launcher(url: &str) -> Command {
    let mut command = Command::new("open");
    command.arg(url);
    command
}

#[cfg(target_os = "windows")]
fn launcher(url: &str) -> Command {
    let mut command = Command::new("cmd");
    command.args(["/C", "start", "", url]);
    command
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn launcher(url: &str) -> Command {
    let mut command = Command::new("xdg-open");
    command.arg(url);
    command
}

/// Never launches anything; the caller prints the URL instead.
///
/// Used by `twaybar login --no-browser` on headless machines.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualBrowser;

impl BrowserOpener for ManualBrowser {
    fn open(&self, _url: &str) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "browser launch disabled",
        ))
    }
}
