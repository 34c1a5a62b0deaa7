#[cfg(feature = "compression-gzip")]
mod gzip {
    use anyhow::Result;
    use chunkjoin::io::compression::{Codec, detect_from_extension, detect_from_magic};
    use chunkjoin::{ChunkedReader, ReadOptions};
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    const TABLE: &str = "idx,name\n0,acme\n1,beta\n2,gamma\n";

    fn gzip(bytes: &[u8]) -> Result<Vec<u8>> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(bytes)?;
        Ok(enc.finish()?)
    }

    #[test]
    fn detects_gzip_by_extension_and_magic() {
        assert_eq!(detect_from_extension("a/b/table.CSV.GZ"), Some(Codec::Gzip));
        assert_eq!(detect_from_extension("table.csv"), None);
        assert_eq!(detect_from_magic(&[0x1f, 0x8b, 0x08]), Some(Codec::Gzip));
        assert_eq!(detect_from_magic(b"idx,name"), None);
    }

    #[test]
    fn reads_gzip_table_by_extension() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let file = tmp.path().join("table.csv.gz");
        std::fs::write(&file, gzip(TABLE.as_bytes())?)?;

        let chunks: Vec<_> =
            ChunkedReader::open(&file, 2, ReadOptions::default())?.collect::<Result<_>>()?;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].rows[0].values, vec!["gamma"]);
        Ok(())
    }

    #[test]
    fn reads_gzip_table_by_magic_bytes() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let file = tmp.path().join("table.dat");
        std::fs::write(&file, gzip(TABLE.as_bytes())?)?;

        let reader = ChunkedReader::open(&file, 10, ReadOptions::default())?;
        assert_eq!(reader.schema().header(), vec!["name"]);
        let rows: usize = reader.map(|c| c.map(|c| c.len())).sum::<Result<usize>>()?;
        assert_eq!(rows, 3);
        Ok(())
    }
}

#[cfg(feature = "compression-zstd")]
#[test]
fn reads_zstd_table() -> anyhow::Result<()> {
    use chunkjoin::{ChunkedReader, ReadOptions};

    let tmp = tempfile::tempdir()?;
    let file = tmp.path().join("table.csv.zst");
    let bytes = zstd::encode_all(&b"idx,name\n4,delta\n"[..], 3)?;
    std::fs::write(&file, bytes)?;

    let mut reader = ChunkedReader::open(&file, 10, ReadOptions::default())?;
    let chunk = reader.next_chunk()?.expect("one chunk");
    assert_eq!(chunk.rows[0].index, 4);
    assert_eq!(chunk.rows[0].values, vec!["delta"]);
    Ok(())
}
