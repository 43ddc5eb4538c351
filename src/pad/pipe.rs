//! Dolphin named-pipe virtual pad.
//!
//! Dolphin's "Pipe" input backend reads newline-terminated text commands
//! from a FIFO in its `Pipes` directory:
//!
//!   PRESS <BTN> / RELEASE <BTN>   with A B X Y Z START L R D_UP D_DOWN D_LEFT D_RIGHT
//!   SET MAIN X <v> / SET MAIN Y <v> / SET C X <v> / SET C Y <v>
//!   SET L <v> / SET R <v>          values in [0, 1], 0.5 = stick center
//!
//! The FIFO is created proactively at startup so the device shows up in
//! Dolphin's list before emulation starts. Opening it for writing fails
//! with ENXIO while no reader is attached; that condition is surfaced as
//! `PipeNotReady` together with setup instructions.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use tracing::info;

use crate::error::{GcError, Result};
use crate::pad::{PadButton, PadButtonSet, RumbleCallback, VirtualPad};

pub const PIPE_NAME: &str = "gc_controller";

/// Triggers this far in count as a full L/R press for the digital buttons.
const CLICK_THRESHOLD: f64 = 0.95;

pub const DOLPHIN_PIPE_HELP: &str = "Dolphin is not reading the pipe.\n\
You may need to restart Dolphin if this is the first time you've launched this tool.\n\
To configure the pipe controller in Dolphin:\n\
1. Open Controllers (top menu bar)\n\
2. Under GameCube, set Port 1 to 'Standard Controller'\n\
3. Click 'Configure' next to Port 1\n\
4. In the Device dropdown, select 'Pipe/0/gc_controller'\n\
5. Update your button/stick/trigger bindings for the pipe device\n\
6. Click Close, then try again";

/// Dolphin's pipe directory on this host.
pub fn pipe_path() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_else(|| ".".into());
    let base = PathBuf::from(home);
    if cfg!(target_os = "macos") {
        base.join("Library/Application Support/Dolphin/Pipes")
            .join(PIPE_NAME)
    } else {
        base.join(".local/share/dolphin-emu/Pipes").join(PIPE_NAME)
    }
}

/// Create the FIFO if it does not exist yet. No-op off POSIX.
#[cfg(unix)]
pub fn ensure_pipe() -> std::io::Result<()> {
    use std::os::unix::ffi::OsStrExt;

    let path = pipe_path();
    if path.exists() {
        return Ok(());
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o666) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    info!("[PIPE] Created FIFO at {}", path.display());
    Ok(())
}

#[cfg(not(unix))]
pub fn ensure_pipe() -> std::io::Result<()> {
    Ok(())
}

fn button_token(button: PadButton) -> Option<&'static str> {
    match button {
        PadButton::A => Some("A"),
        PadButton::B => Some("B"),
        PadButton::X => Some("X"),
        PadButton::Y => Some("Y"),
        PadButton::Start => Some("START"),
        // GameCube Z lives on the right shoulder.
        PadButton::RightShoulder => Some("Z"),
        PadButton::DpadUp => Some("D_UP"),
        PadButton::DpadDown => Some("D_DOWN"),
        PadButton::DpadLeft => Some("D_LEFT"),
        PadButton::DpadRight => Some("D_RIGHT"),
        _ => None,
    }
}

/// Complete desired pipe state for one update.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct PipeFrame {
    main: (f64, f64),
    c: (f64, f64),
    l: f64,
    r: f64,
    buttons: PadButtonSet,
}

impl PipeFrame {
    fn l_clicked(&self) -> bool {
        self.l >= CLICK_THRESHOLD
    }

    fn r_clicked(&self) -> bool {
        self.r >= CLICK_THRESHOLD
    }
}

fn axis01(v: f64) -> f64 {
    ((v + 1.0) / 2.0).clamp(0.0, 1.0)
}

/// Render the commands that take the reader from `prev` to `next`.
/// `prev = None` renders the full state.
fn render_diff(prev: Option<&PipeFrame>, next: &PipeFrame) -> String {
    let mut out = String::new();

    let changed = |get: fn(&PipeFrame) -> f64| -> Option<f64> {
        let v = get(next);
        match prev {
            Some(p) if get(p) == v => None,
            _ => Some(v),
        }
    };

    if let Some(v) = changed(|f| f.main.0) {
        out.push_str(&format!("SET MAIN X {:.4}\n", axis01(v)));
    }
    if let Some(v) = changed(|f| f.main.1) {
        out.push_str(&format!("SET MAIN Y {:.4}\n", axis01(v)));
    }
    if let Some(v) = changed(|f| f.c.0) {
        out.push_str(&format!("SET C X {:.4}\n", axis01(v)));
    }
    if let Some(v) = changed(|f| f.c.1) {
        out.push_str(&format!("SET C Y {:.4}\n", axis01(v)));
    }
    if let Some(v) = changed(|f| f.l) {
        out.push_str(&format!("SET L {v:.4}\n"));
    }
    if let Some(v) = changed(|f| f.r) {
        out.push_str(&format!("SET R {v:.4}\n"));
    }

    let prev_buttons = prev.map(|p| p.buttons).unwrap_or_default();
    for btn in next.buttons.newly_pressed(&prev_buttons) {
        if let Some(token) = button_token(btn) {
            out.push_str(&format!("PRESS {token}\n"));
        }
    }
    for btn in prev_buttons.newly_pressed(&next.buttons) {
        if let Some(token) = button_token(btn) {
            out.push_str(&format!("RELEASE {token}\n"));
        }
    }

    // Digital L/R follow the analog value across the click threshold.
    let (prev_l, prev_r) = match prev {
        Some(p) => (p.l_clicked(), p.r_clicked()),
        None => (false, false),
    };
    if next.l_clicked() != prev_l {
        out.push_str(if next.l_clicked() { "PRESS L\n" } else { "RELEASE L\n" });
    }
    if next.r_clicked() != prev_r {
        out.push_str(if next.r_clicked() { "PRESS R\n" } else { "RELEASE R\n" });
    }

    out
}

/// Virtual pad writing Dolphin pipe commands.
pub struct PipePad {
    file: File,
    current: PipeFrame,
    sent: Option<PipeFrame>,
}

impl PipePad {
    #[cfg(unix)]
    pub fn new() -> Result<Self> {
        use std::os::unix::fs::OpenOptionsExt;

        ensure_pipe().map_err(|e| GcError::Transport(format!("create pipe: {e}")))?;
        let path = pipe_path();
        let file = std::fs::OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
            .map_err(|e| match e.raw_os_error() {
                Some(code) if code == libc::ENXIO => GcError::PipeNotReady {
                    remedy: DOLPHIN_PIPE_HELP.into(),
                },
                _ => GcError::Transport(format!("open {}: {e}", path.display())),
            })?;
        info!("[PIPE] Writing to {}", path.display());
        Ok(Self {
            file,
            current: PipeFrame::default(),
            sent: None,
        })
    }

    #[cfg(not(unix))]
    pub fn new() -> Result<Self> {
        Err(GcError::EmulationUnavailable {
            reason: "Dolphin pipe emulation needs a POSIX host with FIFO support".into(),
        })
    }
}

impl VirtualPad for PipePad {
    fn left_stick(&mut self, x: f64, y: f64) {
        self.current.main = (x, y);
    }

    fn right_stick(&mut self, x: f64, y: f64) {
        self.current.c = (x, y);
    }

    fn trigger_left(&mut self, value: u8) {
        self.current.l = value as f64 / 255.0;
    }

    fn trigger_right(&mut self, value: u8) {
        self.current.r = value as f64 / 255.0;
    }

    fn press(&mut self, button: PadButton) {
        self.current.buttons.set(button, true);
    }

    fn release(&mut self, button: PadButton) {
        self.current.buttons.set(button, false);
    }

    fn update(&mut self) -> Result<()> {
        let text = render_diff(self.sent.as_ref(), &self.current);
        if !text.is_empty() {
            self.file.write_all(text.as_bytes()).map_err(|e| {
                match e.raw_os_error() {
                    #[cfg(unix)]
                    Some(code) if code == libc::EPIPE || code == libc::ENXIO => {
                        GcError::PipeNotReady {
                            remedy: DOLPHIN_PIPE_HELP.into(),
                        }
                    }
                    _ => GcError::Transport(format!("pipe write: {e}")),
                }
            })?;
        }
        self.sent = Some(self.current);
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.current = PipeFrame::default();
        self.update()
    }

    fn close(&mut self) {
        // Dropping the writer is enough; the FIFO itself stays for Dolphin.
    }

    fn set_rumble_callback(&mut self, _callback: Option<RumbleCallback>) {
        // The pipe protocol has no rumble channel.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_frame_renders_all_axes() {
        let frame = PipeFrame::default();
        let text = render_diff(None, &frame);
        assert!(text.contains("SET MAIN X 0.5000\n"));
        assert!(text.contains("SET MAIN Y 0.5000\n"));
        assert!(text.contains("SET C X 0.5000\n"));
        assert!(text.contains("SET C Y 0.5000\n"));
        assert!(text.contains("SET L 0.0000\n"));
        assert!(text.contains("SET R 0.0000\n"));
        assert!(!text.contains("PRESS"));
    }

    #[test]
    fn unchanged_frame_renders_nothing() {
        let frame = PipeFrame::default();
        assert!(render_diff(Some(&frame), &frame).is_empty());
    }

    #[test]
    fn only_changes_are_rendered() {
        let prev = PipeFrame::default();
        let mut next = prev;
        next.main = (1.0, 0.0);
        next.buttons.set(PadButton::A, true);

        let text = render_diff(Some(&prev), &next);
        assert_eq!(text, "SET MAIN X 1.0000\nPRESS A\n");
    }

    #[test]
    fn release_is_rendered_on_button_drop() {
        let mut prev = PipeFrame::default();
        prev.buttons.set(PadButton::Start, true);
        let next = PipeFrame::default();
        let text = render_diff(Some(&prev), &next);
        assert_eq!(text, "RELEASE START\n");
    }

    #[test]
    fn trigger_crossing_threshold_clicks_the_button() {
        let mut prev = PipeFrame::default();
        prev.l = 0.5;
        let mut next = prev;
        next.l = 1.0;
        let text = render_diff(Some(&prev), &next);
        assert!(text.contains("SET L 1.0000\n"));
        assert!(text.contains("PRESS L\n"));

        let text = render_diff(Some(&next), &prev);
        assert!(text.contains("RELEASE L\n"));
    }

    #[test]
    fn z_lives_on_the_right_shoulder() {
        assert_eq!(button_token(PadButton::RightShoulder), Some("Z"));
        // No GameCube equivalents; never rendered.
        assert_eq!(button_token(PadButton::Guide), None);
        assert_eq!(button_token(PadButton::LeftShoulder), None);
    }

    #[test]
    fn pipe_path_ends_with_pipe_name() {
        assert!(pipe_path().ends_with(PathBuf::from("Pipes").join(PIPE_NAME)));
    }
}
