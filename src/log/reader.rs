// src/log/reader.rs

//! Lazy, resumable iteration over a job's log.

use crate::errors::Result;
use crate::log::LogLine;

/// Pages through a log by repeatedly fetching "lines after the last one
/// seen". Ends at the first empty page, so it is finite even while the log
/// is still growing; a new reader started from [`LogReader::position`]
/// picks up exactly where this one stopped.
pub struct LogReader<F>
where
    F: FnMut(u64, usize) -> Result<Vec<LogLine>>,
{
    fetch: F,
    after: u64,
    page_size: usize,
    buffer: std::vec::IntoIter<LogLine>,
    exhausted: bool,
}

impl<F> LogReader<F>
where
    F: FnMut(u64, usize) -> Result<Vec<LogLine>>,
{
    pub fn new(after: u64, page_size: usize, fetch: F) -> Self {
        Self {
            fetch,
            after,
            page_size: page_size.max(1),
            buffer: Vec::new().into_iter(),
            exhausted: false,
        }
    }

    /// `seq_no` of the last line yielded (or the starting point).
    pub fn position(&self) -> u64 {
        self.after
    }
}

impl<F> Iterator for LogReader<F>
where
    F: FnMut(u64, usize) -> Result<Vec<LogLine>>,
{
    type Item = Result<LogLine>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(line) = self.buffer.next() {
            self.after = line.seq_no;
            return Some(Ok(line));
        }
        if self.exhausted {
            return None;
        }

        match (self.fetch)(self.after, self.page_size) {
            Ok(page) if page.is_empty() => {
                self.exhausted = true;
                None
            }
            Ok(page) => {
                if page.len() < self.page_size {
                    self.exhausted = true;
                }
                self.buffer = page.into_iter();
                self.next()
            }
            Err(e) => {
                self.exhausted = true;
                Some(Err(e))
            }
        }
    }
}
