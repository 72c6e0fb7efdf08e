use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};

/// Reads a file or stdin ("-") in fixed-size chunks.
pub struct InputReader {
    reader: Box<dyn Read>,
    len: Option<u64>,
}

impl InputReader {
    pub fn new<P: AsRef<Path>>(input_path: P) -> Result<Self> {
        let path = input_path.as_ref();

        if path.as_os_str() == "-" {
            return Ok(Self {
                reader: Box::new(io::stdin().lock()),
                len: None,
            });
        }

        let file =
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        let len = file.metadata().ok().map(|m| m.len());

        Ok(Self {
            reader: Box::new(BufReader::new(file)),
            len,
        })
    }

    /// Size of the input, unknown for pipes.
    pub fn len(&self) -> Option<u64> {
        self.len
    }

    pub fn is_pipe(&self) -> bool {
        self.len.is_none()
    }

    /// Fills as much of `buffer` as the input allows. Short only at EOF.
    fn read_chunk(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buffer.len() {
            match self.reader.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    /// Feeds the input to `callback` in chunks of `chunk_size` bytes, the
    /// last one possibly shorter. The callback returns `Ok(false)` to stop.
    pub fn process_chunks<F>(&mut self, chunk_size: usize, mut callback: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<bool>,
    {
        let mut buffer = vec![0u8; chunk_size.max(1)];

        loop {
            let bytes_read = self.read_chunk(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }

            if !callback(&buffer[..bytes_read])? {
                break;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_are_full_until_eof() -> Result<()> {
        let mut reader = InputReader {
            reader: Box::new(io::Cursor::new(vec![7u8; 10])),
            len: Some(10),
        };

        let mut sizes = Vec::new();
        reader.process_chunks(4, |chunk| {
            sizes.push(chunk.len());
            Ok(true)
        })?;
        assert_eq!(sizes, [4, 4, 2]);
        Ok(())
    }
}
