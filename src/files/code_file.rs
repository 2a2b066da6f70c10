//! Line-by-line code reader with byte positions.

use super::FileError;
use crate::abort::AbortHandle;
use crate::code::{Code, CodeChannel, CodeParseError};
use async_stream::try_stream;
use futures_util::stream::Stream;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};

/// An open code file bound to a channel. Every code read from it carries the
/// byte offset of its line.
#[derive(Debug)]
pub struct CodeFile {
    path: PathBuf,
    channel: CodeChannel,
    reader: BufReader<File>,
    position: u64,
    line_number: Option<u64>,
    length: u64,
    abort: AbortHandle,
}

impl CodeFile {
    pub async fn open(path: impl AsRef<Path>, channel: CodeChannel) -> Result<Self, FileError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        let length = file.metadata().await?.len();
        tracing::debug!("Opened {} on channel {}", path.display(), channel);
        Ok(Self {
            path,
            channel,
            reader: BufReader::new(file),
            position: 0,
            line_number: Some(0),
            length,
            abort: AbortHandle::new(),
        })
    }

    /// Use an abort handle owned by someone else, e.g. an execution stack frame.
    pub fn with_abort(mut self, abort: AbortHandle) -> Self {
        self.abort = abort;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn channel(&self) -> CodeChannel {
        self.channel
    }

    /// Byte offset of the next line to be read.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    /// Next code of the file, or `None` at the end of the file or once the file
    /// has been aborted. Blank lines are skipped, unparsable lines are skipped
    /// with a warning.
    pub async fn read_code(&mut self) -> Result<Option<Code>, FileError> {
        let mut line = Vec::new();
        loop {
            if self.abort.is_aborted() {
                return Ok(None);
            }
            line.clear();
            let n = self.reader.read_until(b'\n', &mut line).await?;
            if n == 0 {
                return Ok(None);
            }
            let start = self.position;
            self.position += n as u64;
            self.line_number = self.line_number.map(|l| l + 1);

            let text = String::from_utf8_lossy(&line);
            match Code::parse(&text, self.channel) {
                Ok(mut code) => {
                    code.file_position = Some(start);
                    if code.line_number.is_none() {
                        code.line_number = self.line_number;
                    }
                    return Ok(Some(code));
                }
                Err(CodeParseError::Empty) => {}
                Err(e) => {
                    tracing::warn!("{}:{}: {}", self.path.display(), self.line_number.unwrap_or_default(), e);
                }
            }
        }
    }

    /// The remaining codes of the file as a stream.
    pub fn into_codes(mut self) -> impl Stream<Item = Result<Code, FileError>> + Send {
        try_stream! {
            while let Some(code) = self.read_code().await? {
                yield code;
            }
        }
    }

    /// Continue reading at `position`. Line numbers are unknown afterwards
    /// unless the file is rewound to the start.
    pub async fn seek(&mut self, position: u64) -> Result<(), FileError> {
        self.reader.seek(SeekFrom::Start(position)).await?;
        self.position = position;
        self.line_number = (position == 0).then_some(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::CodeType;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn file_with(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_reads_codes_with_positions() {
        let tmp = file_with("G28\n\n; home done\nG1 X10\r\nM400");
        let mut file = CodeFile::open(tmp.path(), CodeChannel::File).await.unwrap();

        let first = file.read_code().await.unwrap().unwrap();
        assert!(first.is(CodeType::GCode, 28));
        assert_eq!(first.file_position, Some(0));
        assert_eq!(first.line_number, Some(1));

        let comment = file.read_code().await.unwrap().unwrap();
        assert_eq!(comment.code_type, CodeType::Comment);
        assert_eq!(comment.file_position, Some(5));

        let mv = file.read_code().await.unwrap().unwrap();
        assert_eq!(mv.file_position, Some(17));
        assert_eq!(mv.line_number, Some(4));

        let last = file.read_code().await.unwrap().unwrap();
        assert!(last.is(CodeType::MCode, 400));
        assert!(file.read_code().await.unwrap().is_none());
        assert_eq!(file.position(), file.length());
    }

    #[tokio::test]
    async fn test_seek_resumes_at_offset() {
        let tmp = file_with("G1 X1\nG1 X2\nG1 X3\n");
        let mut file = CodeFile::open(tmp.path(), CodeChannel::File).await.unwrap();
        file.read_code().await.unwrap();
        file.read_code().await.unwrap();
        file.seek(6).await.unwrap();
        let code = file.read_code().await.unwrap().unwrap();
        assert_eq!(code.file_position, Some(6));
        assert_eq!(code.to_string(), "G1 X2");
        assert_eq!(code.line_number, None);
    }

    #[tokio::test]
    async fn test_abort_ends_reading() {
        let tmp = file_with("G1 X1\nG1 X2\n");
        let mut file = CodeFile::open(tmp.path(), CodeChannel::File).await.unwrap();
        file.abort_handle().abort();
        assert!(file.read_code().await.unwrap().is_none());
        assert!(file.is_aborted());
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = CodeFile::open(dir.path().join("nope.g"), CodeChannel::File).await;
        assert!(matches!(result, Err(FileError::Io(_))));
    }
}
