use std::io::{self, BufWriter, Seek, SeekFrom, Write};

use audiotunnel::structs::wave::{WAVE_FORMAT_LEN, WaveFormatExtensible};

/// Offset of the RIFF size field.
const RIFF_SIZE_POSITION: u64 = 4;

/// Offset of the data chunk size field: RIFF header, fmt chunk header and
/// body, then the `data` tag.
const DATA_SIZE_POSITION: u64 = 12 + 8 + WAVE_FORMAT_LEN as u64 + 4;

/// RIFF WAVE writer with a `WAVEFORMATEXTENSIBLE` fmt chunk.
///
/// Chunk sizes are patched in [`finish`](Self::finish). Data beyond 4 GiB is
/// written but the size fields saturate.
pub struct WavWriter<W: Write + Seek> {
    writer: BufWriter<W>,
    data_written: u64,
}

impl<W: Write + Seek> WavWriter<W> {
    /// Writes the header and positions the writer at the start of the data.
    pub fn new(writer: W, format: WaveFormatExtensible) -> io::Result<Self> {
        let mut writer = BufWriter::new(writer);

        writer.write_all(b"RIFF")?;
        writer.write_all(&0u32.to_le_bytes())?;
        writer.write_all(b"WAVE")?;

        writer.write_all(b"fmt ")?;
        writer.write_all(&(WAVE_FORMAT_LEN as u32).to_le_bytes())?;
        writer.write_all(&format.to_bytes())?;

        writer.write_all(b"data")?;
        writer.write_all(&0u32.to_le_bytes())?;

        Ok(Self {
            writer,
            data_written: 0,
        })
    }

    /// Appends interleaved samples. Frames may straddle calls.
    pub fn write_data(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)?;
        self.data_written += data.len() as u64;
        Ok(())
    }

    /// Patches the chunk sizes and returns the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        let data_size = u32::try_from(self.data_written).unwrap_or(u32::MAX);
        let mut end = self.writer.stream_position()?;

        // RIFF chunks are word aligned.
        if self.data_written % 2 == 1 {
            self.writer.write_all(&[0])?;
            end += 1;
        }

        let riff_size = u32::try_from(end - 8).unwrap_or(u32::MAX);

        self.writer.seek(SeekFrom::Start(RIFF_SIZE_POSITION))?;
        self.writer.write_all(&riff_size.to_le_bytes())?;
        self.writer.seek(SeekFrom::Start(DATA_SIZE_POSITION))?;
        self.writer.write_all(&data_size.to_le_bytes())?;
        self.writer.seek(SeekFrom::Start(end))?;
        self.writer.flush()?;

        self.writer.into_inner().map_err(|e| e.into_error())
    }
}
