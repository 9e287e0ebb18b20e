//! Single-line transfer progress rendering.
//!
//! The reporter draws one status line sized to the current terminal width,
//! overwriting in place with a carriage return so it coexists with
//! surrounding terminal content. Repaints are rate-limited; the line is
//! always cleared or replaced with a summary before passthrough resumes,
//! never left half-overwritten.

use std::time::{Duration, Instant};

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::config::Rgb;
use crate::constants::PROGRESS_INTERVAL;
use crate::error::Result;

/// Point-in-time view of an active transfer, recomputed at chunk
/// boundaries and never persisted.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    /// Zero-based index of the current manifest entry.
    pub file_index: usize,
    /// Number of entries in the manifest.
    pub files_total: usize,
    /// Display name of the current entry.
    pub name: String,
    /// Payload bytes delivered so far, across all entries.
    pub bytes_done: u64,
    /// Total payload bytes in the batch.
    pub bytes_total: u64,
    /// When the session entered Transferring.
    pub started: Instant,
}

impl ProgressSnapshot {
    /// Completed fraction in 0.0..=1.0.
    pub fn fraction(&self) -> f64 {
        if self.bytes_total == 0 {
            1.0
        } else {
            (self.bytes_done as f64 / self.bytes_total as f64).clamp(0.0, 1.0)
        }
    }

    /// Throughput in bytes per second since the transfer started.
    pub fn rate(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.bytes_done as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Estimated seconds remaining, when computable.
    pub fn eta_seconds(&self) -> Option<u64> {
        let rate = self.rate();
        if rate > 0.0 {
            let remaining = self.bytes_total.saturating_sub(self.bytes_done);
            Some((remaining as f64 / rate).ceil() as u64)
        } else {
            None
        }
    }
}

/// Final outcome of a transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferSummary {
    /// Entries transferred successfully.
    pub files_ok: u64,
    /// Entries abandoned after errors.
    pub files_failed: u64,
    /// Entries skipped before transfer.
    pub files_skipped: u64,
    /// Total payload bytes delivered.
    pub bytes: u64,
    /// Wall-clock session duration.
    pub elapsed: Duration,
}

impl TransferSummary {
    /// One-line human-readable summary.
    pub fn format(&self) -> String {
        let secs = self.elapsed.as_secs_f64();
        let rate = if secs > 0.0 { self.bytes as f64 / secs } else { 0.0 };
        let mut line = format!(
            "{} file{}, {} in {:.1}s ({}/s)",
            self.files_ok,
            if self.files_ok == 1 { "" } else { "s" },
            human_bytes(self.bytes),
            secs,
            human_bytes(rate as u64),
        );
        if self.files_failed > 0 {
            line.push_str(&format!(", {} failed", self.files_failed));
        }
        if self.files_skipped > 0 {
            line.push_str(&format!(", {} skipped", self.files_skipped));
        }
        line
    }
}

/// Carriage-return overwrite progress renderer.
#[derive(Debug)]
pub struct ProgressLine {
    colors: Option<(Rgb, Rgb)>,
    last_render: Option<Instant>,
    active: bool,
}

impl ProgressLine {
    /// Create a renderer with an optional gradient color pair.
    pub fn new(colors: Option<(Rgb, Rgb)>) -> Self {
        Self {
            colors,
            last_render: None,
            active: false,
        }
    }

    /// Repaint the progress line.
    ///
    /// Repaints are coalesced to at most one per [`PROGRESS_INTERVAL`]
    /// unless `force` is set (entry boundaries, final repaint).
    pub async fn render<W>(
        &mut self,
        out: &mut W,
        snapshot: &ProgressSnapshot,
        cols: u16,
        force: bool,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        if !force
            && let Some(last) = self.last_render
            && last.elapsed() < PROGRESS_INTERVAL
        {
            return Ok(());
        }
        self.last_render = Some(Instant::now());
        self.active = true;

        let line = self.compose(snapshot, cols);
        out.write_all(b"\r").await?;
        out.write_all(line.as_bytes()).await?;
        out.write_all(b"\x1b[K").await?;
        out.flush().await?;
        Ok(())
    }

    /// Replace the progress line with the session summary and a newline.
    /// Safe to call even if nothing was ever rendered.
    pub async fn finish<W>(&mut self, out: &mut W, summary: &TransferSummary) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        if self.active {
            out.write_all(b"\r\x1b[K").await?;
        }
        out.write_all(summary.format().as_bytes()).await?;
        out.write_all(b"\r\n").await?;
        out.flush().await?;
        self.active = false;
        self.last_render = None;
        Ok(())
    }

    /// Clear the progress line without a summary (aborted before anything
    /// user-visible happened).
    pub async fn clear<W>(&mut self, out: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        if self.active {
            out.write_all(b"\r\x1b[K").await?;
            out.flush().await?;
            self.active = false;
        }
        self.last_render = None;
        Ok(())
    }

    /// Build the line content for the given width. The returned string's
    /// printable width never exceeds `cols - 1`.
    fn compose(&self, snapshot: &ProgressSnapshot, cols: u16) -> String {
        let width = cols.max(20) as usize - 1;
        let fraction = snapshot.fraction();

        let prefix = format!(
            "{} ({}/{}) {:3.0}% ",
            truncate_name(&snapshot.name, width / 3),
            snapshot.file_index + 1,
            snapshot.files_total,
            fraction * 100.0,
        );
        let suffix = match snapshot.eta_seconds() {
            Some(eta) => format!(" {}/s ETA {}", human_bytes(snapshot.rate() as u64), format_secs(eta)),
            None => format!(" {}/s", human_bytes(snapshot.rate() as u64)),
        };

        let fixed = prefix.len() + suffix.len() + 2; // brackets
        if fixed + 4 > width {
            // Too narrow for a bar; percentage only
            let mut line = prefix;
            line.truncate(width);
            return line;
        }

        let bar_width = width - fixed;
        let filled = (fraction * bar_width as f64).round() as usize;
        let bar = self.compose_bar(bar_width, filled);

        format!("{}[{}]{}", prefix, bar, suffix)
    }

    fn compose_bar(&self, bar_width: usize, filled: usize) -> String {
        let filled = filled.min(bar_width);
        match self.colors {
            Some((from, to)) => {
                let mut bar = String::new();
                for i in 0..filled {
                    let t = if bar_width > 1 {
                        i as f64 / (bar_width - 1) as f64
                    } else {
                        0.0
                    };
                    let Rgb(r, g, b) = from.lerp(to, t);
                    bar.push_str(&format!("\x1b[38;2;{};{};{}m=", r, g, b));
                }
                bar.push_str("\x1b[0m");
                bar.push_str(&" ".repeat(bar_width - filled));
                bar
            }
            None => {
                let mut bar = "=".repeat(filled);
                bar.push_str(&" ".repeat(bar_width - filled));
                bar
            }
        }
    }
}

/// Human-readable byte count (binary units, one decimal).
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

fn format_secs(total: u64) -> String {
    format!("{}:{:02}", total / 60, total % 60)
}

/// Truncate an entry name to at most `max` characters, replacing the tail
/// with `..` when it does not fit.
fn truncate_name(name: &str, max: usize) -> String {
    if name.chars().count() <= max {
        return name.to_string();
    }
    if max <= 2 {
        return name.chars().take(max).collect();
    }
    let mut out: String = name.chars().take(max - 2).collect();
    out.push_str("..");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(done: u64, total: u64) -> ProgressSnapshot {
        ProgressSnapshot {
            file_index: 0,
            files_total: 2,
            name: "file.bin".into(),
            bytes_done: done,
            bytes_total: total,
            started: Instant::now(),
        }
    }

    #[test]
    fn fraction_handles_zero_total() {
        assert_eq!(snapshot(0, 0).fraction(), 1.0);
        assert_eq!(snapshot(50, 100).fraction(), 0.5);
    }

    #[test]
    fn truncate_name_bounds() {
        assert_eq!(truncate_name("short.bin", 20), "short.bin");
        assert_eq!(truncate_name("a-rather-long-name.tar.gz", 10), "a-rather..");
        assert_eq!(truncate_name("abcdef", 2), "ab");
        assert!(truncate_name("любой.bin", 7).chars().count() <= 7);
    }

    #[test]
    fn human_bytes_units() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.0 KB");
        assert_eq!(human_bytes(10 * 1024 * 1024), "10.0 MB");
    }

    #[test]
    fn summary_format_variants() {
        let mut summary = TransferSummary {
            files_ok: 1,
            bytes: 10 * 1024 * 1024,
            elapsed: Duration::from_secs(2),
            ..Default::default()
        };
        let line = summary.format();
        assert!(line.starts_with("1 file, 10.0 MB in 2.0s"), "{}", line);
        assert!(!line.contains("failed"));

        summary.files_failed = 2;
        summary.files_skipped = 1;
        let line = summary.format();
        assert!(line.contains("2 failed"), "{}", line);
        assert!(line.contains("1 skipped"), "{}", line);
    }

    #[test]
    fn compose_respects_width() {
        let line = ProgressLine::new(None);
        for cols in [20u16, 40, 80, 200] {
            let rendered = line.compose(&snapshot(30, 100), cols);
            assert!(
                rendered.len() < cols.max(20) as usize,
                "cols={} len={}",
                cols,
                rendered.len()
            );
            assert!(!rendered.contains('\n'));
        }
    }

    #[tokio::test]
    async fn render_overwrites_in_place() {
        let mut line = ProgressLine::new(None);
        let mut out = Vec::new();

        line.render(&mut out, &snapshot(10, 100), 80, true).await.unwrap();
        assert!(out.starts_with(b"\r"));
        assert!(!out.contains(&b'\n'));
        assert!(out.ends_with(b"\x1b[K"));
    }

    #[tokio::test]
    async fn render_is_rate_limited() {
        let mut line = ProgressLine::new(None);
        let mut out = Vec::new();

        line.render(&mut out, &snapshot(10, 100), 80, true).await.unwrap();
        let len = out.len();

        // Immediate unforced repaint is coalesced away
        line.render(&mut out, &snapshot(11, 100), 80, false).await.unwrap();
        assert_eq!(out.len(), len);

        // Forced repaint always draws
        line.render(&mut out, &snapshot(12, 100), 80, true).await.unwrap();
        assert!(out.len() > len);
    }

    #[tokio::test]
    async fn finish_clears_and_summarizes() {
        let mut line = ProgressLine::new(None);
        let mut out = Vec::new();

        line.render(&mut out, &snapshot(100, 100), 80, true).await.unwrap();
        line.finish(&mut out, &TransferSummary::default()).await.unwrap();

        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("\r\x1b[K0 files"));
        assert!(text.ends_with("\r\n"));
    }

    #[tokio::test]
    async fn gradient_bar_emits_truecolor() {
        let mut line = ProgressLine::new(Some((Rgb(255, 0, 0), Rgb(0, 0, 255))));
        let mut out = Vec::new();

        line.render(&mut out, &snapshot(50, 100), 80, true).await.unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("\x1b[38;2;"));
        assert!(text.contains("\x1b[0m"));
    }
}
