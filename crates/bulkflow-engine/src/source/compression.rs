//! Transparent gzip handling for file sources

use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::debug;

use crate::request::Compression;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const READ_BUFFER_BYTES: usize = 256 * 1024;

/// Whether the file must be decompressed
pub fn is_gzip(path: &Path, compression: Compression) -> io::Result<bool> {
    match compression {
        Compression::None => Ok(false),
        Compression::Gzip => Ok(true),
        Compression::Auto => {
            if path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"))
            {
                return Ok(true);
            }
            let mut magic = [0u8; 2];
            let mut file = File::open(path)?;
            match file.read_exact(&mut magic) {
                Ok(()) => Ok(magic == GZIP_MAGIC),
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
                Err(e) => Err(e),
            }
        },
    }
}

/// Open a file positioned `offset` bytes into its decoded content.
///
/// Plain files seek; gzip streams cannot, so the decoded prefix is read and discarded.
pub fn open_at(path: &Path, gzip: bool, offset: u64) -> io::Result<Box<dyn BufRead + Send>> {
    let mut file = File::open(path)?;
    if !gzip {
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))?;
        }
        return Ok(Box::new(BufReader::with_capacity(READ_BUFFER_BYTES, file)));
    }

    let mut reader = BufReader::with_capacity(READ_BUFFER_BYTES, MultiGzDecoder::new(file));
    if offset > 0 {
        let skipped = io::copy(&mut (&mut reader).take(offset), &mut io::sink())?;
        debug!(path = %path.display(), skipped, "Skipped decoded prefix of gzip stream");
        if skipped < offset {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("resume offset {offset} is beyond the end of {}", path.display()),
            ));
        }
    }
    Ok(Box::new(reader))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn gzip_file(dir: &Path, name: &str, content: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), flate2::Compression::fast());
        encoder.write_all(content).unwrap();
        encoder.finish().unwrap();
        path
    }

    #[test]
    fn test_auto_detects_by_magic_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = gzip_file(dir.path(), "export.dat", b"a;b\n1;2\n");
        assert!(is_gzip(&path, Compression::Auto).unwrap());

        let plain = dir.path().join("plain.csv");
        std::fs::write(&plain, "a;b\n").unwrap();
        assert!(!is_gzip(&plain, Compression::Auto).unwrap());

        let empty = dir.path().join("empty.csv");
        std::fs::write(&empty, "").unwrap();
        assert!(!is_gzip(&empty, Compression::Auto).unwrap());
    }

    #[test]
    fn test_open_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let content = b"header\nfirst\nsecond\n";

        let plain = dir.path().join("rows.csv");
        std::fs::write(&plain, content).unwrap();
        let mut rest = String::new();
        open_at(&plain, false, 13).unwrap().read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "second\n");

        let gz = gzip_file(dir.path(), "rows.csv.gz", content);
        let mut rest = String::new();
        open_at(&gz, true, 13).unwrap().read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "second\n");

        assert!(open_at(&gz, true, 500).is_err());
    }
}
