//! Stream codecs and the encryption seam.
//!
//! The byte order on the wire is authoritative: plaintext is compressed,
//! the compressed stream is encrypted, and the result becomes the object
//! body. Restore reverses the chain. Codecs coexist by file extension;
//! WAL fetch probes extensions in a fixed priority order.

use std::io::{self, Read, Write};
use std::sync::Arc;

/// A writer that must be explicitly finished to flush trailing frames
/// down the chain.
pub trait FinishWrite: Write + Send {
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// Plain sink terminating a writer chain.
pub struct SinkWriter<W: Write + Send>(pub W);

impl<W: Write + Send> Write for SinkWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<W: Write + Send> FinishWrite for SinkWriter<W> {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.0.flush()
    }
}

/// A stream compressor selected by file extension.
pub trait Codec: Send + Sync {
    /// Extension this codec appends to object names (no leading dot).
    fn extension(&self) -> &'static str;

    /// Wraps a sink; bytes written come out compressed below.
    fn compress(&self, sink: Box<dyn FinishWrite>) -> io::Result<Box<dyn FinishWrite>>;

    /// Wraps a source of compressed bytes into a plaintext reader.
    fn decompress(&self, source: Box<dyn Read + Send>) -> io::Result<Box<dyn Read + Send>>;
}

struct Lz4Writer(Option<lz4_flex::frame::FrameEncoder<Box<dyn FinishWrite>>>);

impl Write for Lz4Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .as_mut()
            .expect("write after finish")
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.as_mut().expect("flush after finish").flush()
    }
}

impl FinishWrite for Lz4Writer {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        let encoder = self.0.take().expect("double finish");
        let inner = encoder
            .finish()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        inner.finish()
    }
}

/// LZ4 frame codec; the default for new archives.
pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn extension(&self) -> &'static str {
        "lz4"
    }

    fn compress(&self, sink: Box<dyn FinishWrite>) -> io::Result<Box<dyn FinishWrite>> {
        Ok(Box::new(Lz4Writer(Some(lz4_flex::frame::FrameEncoder::new(
            sink,
        )))))
    }

    fn decompress(&self, source: Box<dyn Read + Send>) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(lz4_flex::frame::FrameDecoder::new(source)))
    }
}

struct ZstdWriter(Option<zstd::stream::Encoder<'static, Box<dyn FinishWrite>>>);

impl Write for ZstdWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.as_mut().expect("write after finish").write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.as_mut().expect("flush after finish").flush()
    }
}

impl FinishWrite for ZstdWriter {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        let encoder = self.0.take().expect("double finish");
        let inner = encoder.finish()?;
        inner.finish()
    }
}

/// Zstandard stream codec.
pub struct ZstdCodec;

impl Codec for ZstdCodec {
    fn extension(&self) -> &'static str {
        "zst"
    }

    fn compress(&self, sink: Box<dyn FinishWrite>) -> io::Result<Box<dyn FinishWrite>> {
        let encoder = zstd::stream::Encoder::new(sink, 0)?;
        Ok(Box::new(ZstdWriter(Some(encoder))))
    }

    fn decompress(&self, source: Box<dyn Read + Send>) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(zstd::stream::Decoder::new(source)?))
    }
}

/// Probe order for fetches that must guess the extension. Earlier entries
/// win when the same segment was archived twice under different codecs.
pub fn codec_priority() -> Vec<Arc<dyn Codec>> {
    vec![Arc::new(Lz4Codec), Arc::new(ZstdCodec)]
}

/// Codec used for new archives.
pub fn default_codec() -> Arc<dyn Codec> {
    Arc::new(Lz4Codec)
}

/// Resolves a codec from an object name extension.
pub fn codec_for_extension(ext: &str) -> Option<Arc<dyn Codec>> {
    codec_priority().into_iter().find(|c| c.extension() == ext)
}

/// Resolves a codec from a full object key (`....tar.lz4`).
pub fn codec_for_key(key: &str) -> Option<Arc<dyn Codec>> {
    key.rsplit('.').next().and_then(codec_for_extension)
}

/// Optional encryption wrapping the compressed stream.
pub trait Crypter: Send + Sync {
    fn is_used(&self) -> bool;

    fn encrypt(&self, sink: Box<dyn FinishWrite>) -> io::Result<Box<dyn FinishWrite>>;

    fn decrypt(&self, source: Box<dyn Read + Send>) -> io::Result<Box<dyn Read + Send>>;
}

/// Pass-through crypter used when no encryption key is configured.
pub struct NoCrypter;

impl Crypter for NoCrypter {
    fn is_used(&self) -> bool {
        false
    }

    fn encrypt(&self, sink: Box<dyn FinishWrite>) -> io::Result<Box<dyn FinishWrite>> {
        Ok(sink)
    }

    fn decrypt(&self, source: Box<dyn Read + Send>) -> io::Result<Box<dyn Read + Send>> {
        Ok(source)
    }
}

/// In-memory sink for compressing small payloads (WAL segments).
#[derive(Clone, Default)]
pub struct SharedBuffer(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut self.0.lock().expect("buffer poisoned"))
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("buffer poisoned").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl FinishWrite for SharedBuffer {
    fn finish(self: Box<Self>) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(codec: &dyn Codec, payload: &[u8]) -> Vec<u8> {
        let buffer = SharedBuffer::new();
        let mut writer = codec.compress(Box::new(buffer.clone())).unwrap();
        writer.write_all(payload).unwrap();
        writer.finish().unwrap();

        let compressed = buffer.take();
        let mut reader = codec
            .decompress(Box::new(Cursor::new(compressed)))
            .unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn lz4_roundtrip() {
        let payload = b"the quick brown fox".repeat(100);
        assert_eq!(roundtrip(&Lz4Codec, &payload), payload);
    }

    #[test]
    fn zstd_roundtrip() {
        let payload = vec![7u8; 64 * 1024];
        assert_eq!(roundtrip(&ZstdCodec, &payload), payload);
    }

    #[test]
    fn extension_lookup() {
        assert_eq!(codec_for_extension("lz4").unwrap().extension(), "lz4");
        assert_eq!(codec_for_key("part_001.tar.zst").unwrap().extension(), "zst");
        assert!(codec_for_extension("lzo").is_none());
    }

    #[test]
    fn lz4_probes_before_zstd() {
        let order: Vec<_> = codec_priority().iter().map(|c| c.extension()).collect();
        assert_eq!(order, ["lz4", "zst"]);
    }
}
