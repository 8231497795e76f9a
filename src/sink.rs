use std::io::{self, Write};

use nix::unistd::Pid;

use crate::frame::{dedup_by_proc_name, Stacktrace};
use crate::screen::Screen;
use crate::statistic::RunningStatistic;
use crate::symbols::{abbrev, demangle};

/// Consumes one round of stacktraces per tick, plus out-of-band diagnostics.
pub trait Sink {
    fn tick(&mut self, stacktraces: Vec<(Pid, Stacktrace)>);
    fn info_line(&mut self, line: String);
}

/// Prints a single round of stacktraces, one block per thread.
pub struct OneshotSink<W> {
    out: W,
}

impl<W> OneshotSink<W> {
    pub fn new(out: W) -> OneshotSink<W> {
        OneshotSink { out }
    }
}

impl<W: Write> Sink for OneshotSink<W> {
    fn tick(&mut self, stacktraces: Vec<(Pid, Stacktrace)>) {
        for (tid, stacktrace) in stacktraces {
            let _ = writeln!(self.out, "Thread {}:", tid);
            for frame in &stacktrace {
                let _ = writeln!(
                    self.out,
                    "0x{:x} {}",
                    frame.ip,
                    abbrev(&demangle(&frame.proc_name))
                );
            }
            let _ = writeln!(self.out);
        }
    }

    fn info_line(&mut self, line: String) {
        let _ = writeln!(self.out, "{}", line);
    }
}

/// Rolls every tick into the sliding statistic and periodically redraws the
/// hottest-functions table.
pub struct ProfilingSink {
    statistic: RunningStatistic,
    sampling: usize,
    iteration: usize,
    info_lines: Vec<String>,
    screen: Screen,
}

const WINDOW_TICKS_PER_HZ: usize = 10;
const RENDERS_PER_SEC: usize = 10;
const TOP_COUNT: usize = 30;

impl ProfilingSink {
    pub fn new(sampling: usize) -> io::Result<ProfilingSink> {
        Ok(ProfilingSink {
            statistic: RunningStatistic::new(sampling * WINDOW_TICKS_PER_HZ),
            sampling,
            iteration: 0,
            info_lines: Vec::new(),
            screen: Screen::new()?,
        })
    }
}

fn render_lines(statistic: &RunningStatistic, info_lines: &mut Vec<String>) -> Vec<String> {
    let mut lines: Vec<String> = statistic
        .top_frames(TOP_COUNT)
        .into_iter()
        .map(|(ratio, name)| format!("{:6.2}% {}", ratio * 100.0, abbrev(&demangle(&name))))
        .collect();
    if !info_lines.is_empty() {
        lines.push(String::new());
        lines.push("INFO:".to_string());
        lines.append(info_lines);
    }
    lines
}

impl Sink for ProfilingSink {
    fn tick(&mut self, stacktraces: Vec<(Pid, Stacktrace)>) {
        let mut frames = Vec::new();
        for (_tid, stacktrace) in &stacktraces {
            frames.extend(dedup_by_proc_name(stacktrace));
        }
        self.statistic.push_frames(frames);
        self.iteration += 1;
        if self.iteration % (self.sampling / RENDERS_PER_SEC) == 0 {
            let lines = render_lines(&self.statistic, &mut self.info_lines);
            let _ = self.screen.put_lines(lines.iter().map(|line| line.as_str()));
        }
    }

    fn info_line(&mut self, line: String) {
        self.info_lines.push(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    fn frame(ip: u64, name: &str) -> Frame {
        Frame {
            ip,
            sp: 0,
            proc_name: name.to_string(),
        }
    }

    #[test]
    fn oneshot_prints_one_block_per_thread() {
        let mut out = Vec::new();
        {
            let mut sink = OneshotSink::new(&mut out);
            sink.tick(vec![
                (Pid::from_raw(11), vec![frame(0x1000, "pause"), frame(0x2000, "main")]),
                (Pid::from_raw(12), vec![frame(0x3000, "_Z3foov")]),
            ]);
        }
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "Thread 11:\n0x1000 pause\n0x2000 main\n\nThread 12:\n0x3000 foo()\n\n"
        );
    }

    #[test]
    fn rendered_table_has_percent_lines_and_info_block() {
        let mut statistic = RunningStatistic::new(4);
        statistic.push_frames(vec![frame(1, "hot"), frame(2, "cold")]);
        statistic.push_frames(vec![frame(1, "hot")]);

        let mut info = vec!["Exception: thread is gone".to_string()];
        let lines = render_lines(&statistic, &mut info);
        assert_eq!(lines[0], "100.00% hot");
        assert_eq!(lines[1], " 50.00% cold");
        assert_eq!(lines[2], "");
        assert_eq!(lines[3], "INFO:");
        assert_eq!(lines[4], "Exception: thread is gone");
        // queued lines drain once rendered
        assert!(info.is_empty());
    }
}
