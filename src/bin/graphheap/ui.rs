//! Terminal rendering for region reports.

use std::fmt::Display;
use std::io::IsTerminal;
use std::time::{Duration, Instant};

use clap::ValueEnum;
use indicatif::{ProgressBar, ProgressStyle};
use nu_ansi_term::{Color, Style};

const GAUGE_WIDTH: usize = 24;
const GAUGE_ALERT: f64 = 0.9;

/// Color choice for text output.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum Theme {
    /// Color when stdout is a terminal.
    Auto,
    /// Never color.
    Plain,
}

#[derive(Clone, Copy)]
struct Styles {
    title: Style,
    label: Style,
    ok: Style,
    alert: Style,
    dim: Style,
}

impl Styles {
    fn terminal() -> Self {
        Self {
            title: Style::new().fg(Color::Cyan).bold(),
            label: Style::new().fg(Color::LightBlue),
            ok: Style::new().fg(Color::LightGreen).bold(),
            alert: Style::new().fg(Color::Yellow).bold(),
            dim: Style::new().fg(Color::DarkGray),
        }
    }
}

type Pick = fn(&Styles) -> Style;

/// Prints region, pool and barrier reports to stdout; warnings and
/// spinners go to stderr.
pub struct Ui {
    styles: Option<Styles>,
    quiet: bool,
}

impl Ui {
    pub fn new(theme: Theme, quiet: bool) -> Self {
        let styles = (theme == Theme::Auto && !quiet && std::io::stdout().is_terminal())
            .then(Styles::terminal);
        Self { styles, quiet }
    }

    fn paint(&self, pick: Pick, text: impl Display) -> String {
        match &self.styles {
            Some(styles) => pick(styles).paint(text.to_string()).to_string(),
            None => text.to_string(),
        }
    }

    /// Titled block of aligned `label value` rows.
    pub fn fields(&self, title: &str, rows: &[(&str, String)]) {
        println!("{}", self.paint(|s| s.title, title));
        let width = rows.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
        for (key, value) in rows {
            println!("  {} {value}", self.paint(|s| s.label, format!("{key:<width$}")));
        }
    }

    /// Titled block of preformatted lines.
    pub fn lines<I>(&self, title: &str, lines: I)
    where
        I: IntoIterator<Item = String>,
    {
        println!("{}", self.paint(|s| s.title, title));
        for line in lines {
            println!("  {line}");
        }
    }

    /// One-line fill gauge of `used` out of `total` bytes.
    pub fn gauge(&self, label: &str, used: u64, total: u64) {
        let ratio = if total == 0 {
            0.0
        } else {
            (used as f64 / total as f64).clamp(0.0, 1.0)
        };
        let filled = (ratio * GAUGE_WIDTH as f64).round() as usize;
        let bar = format!("{}{}", "#".repeat(filled), ".".repeat(GAUGE_WIDTH - filled));
        let pick: Pick = if ratio >= GAUGE_ALERT {
            |s: &Styles| s.alert
        } else {
            |s: &Styles| s.ok
        };
        println!(
            "  {} [{}] {:>5.1}% of {}",
            self.paint(|s| s.label, label),
            self.paint(pick, bar),
            ratio * 100.0,
            format_bytes(total)
        );
    }

    /// Every barrier slot as one marker: `*` signalled, `.` clear.
    pub fn barrier_row(&self, set: &[u32], slots: u32) {
        let row: String = (0..slots)
            .map(|id| {
                if set.contains(&id) {
                    self.paint(|s| s.ok, '*')
                } else {
                    self.paint(|s| s.dim, '.')
                }
            })
            .collect();
        println!(
            "  {} {row}  {}/{slots} set",
            self.paint(|s| s.label, "barriers"),
            set.len()
        );
    }

    pub fn done(&self, message: &str) {
        println!("{} {message}", self.paint(|s| s.ok, "ok"));
    }

    pub fn alert(&self, message: &str) {
        eprintln!("{} {message}", self.paint(|s| s.alert, "warning:"));
    }

    /// Spinner on stderr while a blocking region call runs.
    pub fn waiting(&self, what: impl Into<String>) -> Waiting {
        let what = what.into();
        let bar = (!self.quiet).then(|| {
            let bar = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::with_template("{spinner} {msg} {elapsed}") {
                bar.set_style(style);
            }
            bar.set_message(what.clone());
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        });
        Waiting {
            what,
            bar,
            started: Instant::now(),
        }
    }
}

/// Live spinner. Dropped without [`Waiting::done`], it leaves a note on
/// stderr saying how long the call ran.
pub struct Waiting {
    what: String,
    bar: Option<ProgressBar>,
    started: Instant,
}

impl Waiting {
    /// Clears the spinner; returns the time spent.
    pub fn done(mut self) -> Duration {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
        self.started.elapsed()
    }
}

impl Drop for Waiting {
    fn drop(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.abandon_with_message(format!(
                "{} stopped after {}",
                self.what,
                format_ms(self.started.elapsed())
            ));
        }
    }
}

pub fn format_ms(duration: Duration) -> String {
    match duration.as_millis() {
        ms if ms >= 10_000 => format!("{:.1}s", duration.as_secs_f64()),
        ms => format!("{ms}ms"),
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
