use super::parser::LineParser;
use crate::models::AuthEvent;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::PathBuf;

/// Tail an auth log file and parse sshd events
pub struct FileTailer {
    file_path: PathBuf,
    reader: Option<BufReader<File>>,
    file_position: u64,
    from_start: bool,
    parser: LineParser,
}

impl FileTailer {
    /// Create a tailer that only reports lines appended after it starts
    pub fn new(file_path: PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        Ok(FileTailer {
            file_path,
            reader: None,
            file_position: 0,
            from_start: false,
            parser: LineParser::new()?,
        })
    }

    /// Also report the lines already in the file
    pub fn from_start(mut self, from_start: bool) -> Self {
        self.from_start = from_start;
        self
    }

    /// Initialize the file reader
    pub fn initialize(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let file = File::open(&self.file_path)?;
        let mut reader = BufReader::new(file);

        if !self.from_start {
            reader.seek(SeekFrom::End(0))?;
        }
        self.file_position = reader.stream_position()?;
        self.reader = Some(reader);

        Ok(())
    }

    /// Read the events appended since the last call
    pub fn read_events(&mut self) -> Result<Vec<AuthEvent>, Box<dyn std::error::Error>> {
        if self.reader.is_none() {
            self.initialize()?;
        }

        let reader = self.reader.as_mut().ok_or("Reader not initialized")?;
        let mut events = Vec::new();

        loop {
            let mut line = String::new();
            let bytes_read = reader.read_line(&mut line)?;

            if bytes_read == 0 {
                break; // EOF
            }

            if !line.ends_with('\n') {
                // partial line; reread it once the writer finishes it
                reader.seek(SeekFrom::Start(self.file_position))?;
                break;
            }

            self.file_position += bytes_read as u64;

            match self.parser.parse(&line) {
                Ok(event) => events.push(event),
                Err(e) => log::trace!("Skipping line: {}", e),
            }
        }

        Ok(events)
    }

    /// Check if the file still exists and is readable
    pub fn is_valid(&self) -> bool {
        self.file_path.exists()
    }

    pub fn position(&self) -> u64 {
        self.file_position
    }
}

// ============================================
// Async File Tailer
// ============================================

use tokio::fs::File as AsyncFile;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader as AsyncBufReader};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

/// Async version of FileTailer for use with tokio
pub struct AsyncFileTailer {
    file_path: PathBuf,
    from_start: bool,
    parser: LineParser,
}

impl AsyncFileTailer {
    pub fn new(
        file_path: PathBuf,
        from_start: bool,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(AsyncFileTailer {
            file_path,
            from_start,
            parser: LineParser::new()?,
        })
    }

    /// Run the file tailer, sending events through the channel
    ///
    /// Runs until the channel is closed or the file cannot be opened.
    pub async fn run(
        &mut self,
        tx: mpsc::Sender<AuthEvent>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let file = AsyncFile::open(&self.file_path).await?;
        let mut reader = AsyncBufReader::new(file);

        if !self.from_start {
            reader.seek(std::io::SeekFrom::End(0)).await?;
        }

        log::info!("Async file tailer started for {:?}", self.file_path);

        let mut line = String::new();
        loop {
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    // EOF - wait for more data
                    sleep(Duration::from_millis(100)).await;
                }
                Ok(_) if !line.ends_with('\n') => {
                    // partial line; the rest is still being written
                    sleep(Duration::from_millis(100)).await;
                }
                Ok(_) => {
                    match self.parser.parse(&line) {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                log::info!("Channel closed, stopping file tailer");
                                break;
                            }
                        }
                        Err(e) => log::trace!("Skipping line: {}", e),
                    }
                    line.clear();
                }
                Err(e) => {
                    log::error!("Error reading file: {}", e);
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AuthStatus;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const ACCEPTED: &str =
        "Jan  1 12:00:00 host sshd[1]: Accepted publickey for alice from 192.168.1.100 port 1 ssh2\n";
    const NOISE: &str = "Jan  1 12:00:01 host CRON[2]: session opened for user root\n";
    const DISCONNECTED: &str =
        "Jan  1 12:00:02 host sshd[1]: Disconnected from user alice 192.168.1.100 port 1\n";

    #[test]
    fn test_tails_only_new_lines() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(ACCEPTED.as_bytes()).unwrap();

        let mut tailer = FileTailer::new(file.path().to_path_buf()).unwrap();
        tailer.initialize().unwrap();
        assert!(tailer.read_events().unwrap().is_empty());

        file.write_all(NOISE.as_bytes()).unwrap();
        file.write_all(DISCONNECTED.as_bytes()).unwrap();
        file.flush().unwrap();

        let events = tailer.read_events().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, AuthStatus::Disconnected);
        assert_eq!(tailer.position(), (ACCEPTED.len() + NOISE.len() + DISCONNECTED.len()) as u64);
    }

    #[test]
    fn test_partial_line_waits_for_newline() {
        let mut file = NamedTempFile::new().unwrap();
        let mut tailer = FileTailer::new(file.path().to_path_buf()).unwrap();
        tailer.initialize().unwrap();

        let (head, tail) = ACCEPTED.split_at(40);
        file.write_all(head.as_bytes()).unwrap();
        file.flush().unwrap();
        assert!(tailer.read_events().unwrap().is_empty());
        assert_eq!(tailer.position(), 0);

        file.write_all(tail.as_bytes()).unwrap();
        file.flush().unwrap();
        let events = tailer.read_events().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].username, "alice");
        assert_eq!(events[0].remote_origin, "192.168.1.100");
        assert_eq!(tailer.position(), ACCEPTED.len() as u64);
    }

    #[test]
    fn test_from_start_reads_existing_lines() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(ACCEPTED.as_bytes()).unwrap();
        file.write_all(NOISE.as_bytes()).unwrap();
        file.flush().unwrap();

        let mut tailer = FileTailer::new(file.path().to_path_buf())
            .unwrap()
            .from_start(true);
        let events = tailer.read_events().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].username, "alice");
    }

    #[tokio::test]
    async fn test_async_tailer_sends_events() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(ACCEPTED.as_bytes()).unwrap();
        file.write_all(DISCONNECTED.as_bytes()).unwrap();
        file.flush().unwrap();

        let mut tailer = AsyncFileTailer::new(file.path().to_path_buf(), true).unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = tokio::spawn(async move { tailer.run(tx).await.map_err(|e| e.to_string()) });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.status, AuthStatus::Accepted);
        assert_eq!(second.status, AuthStatus::Disconnected);

        drop(rx);
        handle.abort();
    }
}
