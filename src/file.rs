//! Raster file handles.
//!
//! The IR only ever touches storage through the [`RasterFile`] trait; real
//! format back-ends live in the surrounding runtime. Two implementations
//! ship here: a flat-binary reference format (`.bin`) with a small
//! self-describing header, and an anonymous scratch format backing
//! `Checkpoint` nodes. Handles are shared: several I/O nodes may hold the
//! same file, and the file closes when the last holder drops.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::ir::{Coord, DataType, MemOrder, MetaData, StreamDir};
use crate::result::{IrError, IrResult};

/// Shared handle to a raster file.
pub type FileHandle = Arc<dyn RasterFile + Send + Sync>;

/// The storage format behind a handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileFormat {
    /// Flat binary with a self-describing header.
    Bin,
    /// Anonymous temporary storage for checkpoints.
    Scratch,
}

/// A raster file abstraction.
///
/// The construction protocol mirrors how I/O node factories drive it:
/// create via [`factory`], configure with [`RasterFile::set_metadata`] when
/// writing, then [`RasterFile::open`]. Blocks are addressed by block
/// coordinate and stored padded to the full block extent.
pub trait RasterFile: std::fmt::Debug {
    /// The file path.
    fn path(&self) -> &Path;

    /// The storage format.
    fn format(&self) -> FileFormat;

    /// The data configuration, available once set or read from the header.
    fn metadata(&self) -> IrResult<MetaData>;

    /// Set the data configuration prior to opening for output.
    fn set_metadata(&self, meta: MetaData, dir: StreamDir) -> IrResult<()>;

    /// Open the file in the given direction.
    fn open(&self, dir: StreamDir) -> IrResult<()>;

    /// Read the block at the given block coordinate.
    fn read_block(&self, coord: Coord) -> IrResult<Vec<u8>>;

    /// Write the block at the given block coordinate.
    fn write_block(&self, coord: Coord, data: &[u8]) -> IrResult<()>;
}

/// Infer a format from the path suffix and create an unopened handle.
///
/// Unknown suffixes are an [`IrError::FileFormatUnknown`].
pub fn factory(path: &Path) -> IrResult<FileHandle> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("bin") => Ok(Arc::new(BinFile::new(path))),
        _ => Err(IrError::FileFormatUnknown(path.to_path_buf())),
    }
}

/// Create a scratch handle backed by an anonymous temporary file.
pub fn scratch() -> IrResult<FileHandle> {
    let file = tempfile::NamedTempFile::new().map_err(|source| IrError::FileIoError {
        path: PathBuf::from("<scratch>"),
        source,
    })?;
    debug!("scratch raster at {}", file.path().display());
    Ok(Arc::new(ScratchFile {
        path: file.path().to_path_buf(),
        inner: Mutex::new(ScratchInner { file, meta: None }),
    }))
}

fn io_err(path: &Path, source: std::io::Error) -> IrError {
    IrError::FileIoError {
        path: path.to_path_buf(),
        source,
    }
}

fn dtype_code(dt: DataType) -> u8 {
    match dt {
        DataType::U8 => 0,
        DataType::U16 => 1,
        DataType::U32 => 2,
        DataType::U64 => 3,
        DataType::S8 => 4,
        DataType::S16 => 5,
        DataType::S32 => 6,
        DataType::S64 => 7,
        DataType::F32 => 8,
        DataType::F64 => 9,
    }
}

fn dtype_from(code: u8) -> Option<DataType> {
    Some(match code {
        0 => DataType::U8,
        1 => DataType::U16,
        2 => DataType::U32,
        3 => DataType::U64,
        4 => DataType::S8,
        5 => DataType::S16,
        6 => DataType::S32,
        7 => DataType::S64,
        8 => DataType::F32,
        9 => DataType::F64,
        _ => return None,
    })
}

fn order_code(mo: MemOrder) -> u8 {
    match mo {
        MemOrder::RowPos => 0,
        MemOrder::RowNeg => 1,
        MemOrder::ColPos => 2,
        MemOrder::ColNeg => 3,
        MemOrder::Blk => 4,
        MemOrder::Sfc => 5,
    }
}

fn order_from(code: u8) -> Option<MemOrder> {
    Some(match code {
        0 => MemOrder::RowPos,
        1 => MemOrder::RowNeg,
        2 => MemOrder::ColPos,
        3 => MemOrder::ColNeg,
        4 => MemOrder::Blk,
        5 => MemOrder::Sfc,
        _ => return None,
    })
}

/// Row-major linear index of a block coordinate within the block grid.
fn block_index(meta: &MetaData, coord: Coord) -> IrResult<u64> {
    let shape = meta.data_shape();
    if coord.rank() != shape.rank() {
        return Err(IrError::invalid(format!(
            "block coordinate {coord} has rank {}, file has rank {}",
            coord.rank(),
            shape.rank()
        )));
    }
    let mut idx: u64 = 0;
    for axis in 0..shape.rank() {
        let c = coord.get(axis);
        let s = shape.get(axis);
        if c < 0 || c >= s {
            return Err(IrError::invalid(format!(
                "block coordinate {coord} outside block grid {shape}"
            )));
        }
        idx = idx * s as u64 + c as u64;
    }
    Ok(idx)
}

fn block_bytes(meta: &MetaData) -> u64 {
    (meta.block_size().cells() * meta.data_type().width_bytes()) as u64
}

const BIN_MAGIC: &[u8; 4] = b"MFRB";
const BIN_VERSION: u8 = 1;

struct BinInner {
    meta: Option<MetaData>,
    file: Option<fs::File>,
    dir: StreamDir,
}

/// The flat-binary reference format.
///
/// Layout: magic, version, cell-type code, order code, rank, then per-axis
/// extents and block extents as little-endian `i32`, followed by the blocks
/// in row-major block order, each padded to the full block extent.
pub struct BinFile {
    path: PathBuf,
    inner: Mutex<BinInner>,
}

impl std::fmt::Debug for BinFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinFile").field("path", &self.path).finish()
    }
}

impl BinFile {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            inner: Mutex::new(BinInner {
                meta: None,
                file: None,
                dir: StreamDir::None,
            }),
        }
    }

    fn header_len(rank: usize) -> u64 {
        (4 + 1 + 1 + 1 + 1 + rank * 2 * 4) as u64
    }

    fn write_header(&self, file: &mut fs::File, meta: &MetaData) -> IrResult<()> {
        let mut buf = Vec::new();
        buf.extend_from_slice(BIN_MAGIC);
        buf.push(BIN_VERSION);
        buf.push(dtype_code(meta.data_type()));
        buf.push(order_code(meta.mem_order()));
        buf.push(meta.num_dim().rank() as u8);
        for &axis in meta.data_size().as_slice() {
            buf.extend_from_slice(&axis.to_le_bytes());
        }
        for &axis in meta.block_size().as_slice() {
            buf.extend_from_slice(&axis.to_le_bytes());
        }
        file.write_all(&buf).map_err(|e| io_err(&self.path, e))
    }

    fn read_header(&self, file: &mut fs::File) -> IrResult<MetaData> {
        let bad = |msg: &str| IrError::invalid(format!("{}: {msg}", self.path.display()));
        let mut fixed = [0u8; 8];
        file.read_exact(&mut fixed)
            .map_err(|e| io_err(&self.path, e))?;
        if fixed[..4] != *BIN_MAGIC || fixed[4] != BIN_VERSION {
            return Err(bad("not a mapfuse binary raster"));
        }
        let dt = dtype_from(fixed[5]).ok_or_else(|| bad("unknown cell type"))?;
        let mo = order_from(fixed[6]).ok_or_else(|| bad("unknown memory order"))?;
        let rank = fixed[7] as usize;
        if rank == 0 || rank > 3 {
            return Err(bad("unsupported rank"));
        }
        let mut axes = [0u8; 4];
        let mut read_coord = |file: &mut fs::File| -> IrResult<Coord> {
            let mut out = Vec::with_capacity(rank);
            for _ in 0..rank {
                file.read_exact(&mut axes)
                    .map_err(|e| io_err(&self.path, e))?;
                out.push(i32::from_le_bytes(axes));
            }
            Ok(Coord::new(&out))
        };
        let size = read_coord(file)?;
        let block = read_coord(file)?;
        Ok(MetaData::new(size, dt, mo, block))
    }
}

impl RasterFile for BinFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> FileFormat {
        FileFormat::Bin
    }

    fn metadata(&self) -> IrResult<MetaData> {
        let inner = self.inner.lock().expect("raster file lock poisoned");
        inner
            .meta
            .ok_or_else(|| IrError::invalid(format!("{}: metadata not set", self.path.display())))
    }

    fn set_metadata(&self, meta: MetaData, dir: StreamDir) -> IrResult<()> {
        if meta.num_dim().rank() == 0 {
            return Err(IrError::invalid("raster files cannot hold D0 values"));
        }
        let mut inner = self.inner.lock().expect("raster file lock poisoned");
        inner.meta = Some(meta.with_stream_dir(dir));
        Ok(())
    }

    fn open(&self, dir: StreamDir) -> IrResult<()> {
        let mut inner = self.inner.lock().expect("raster file lock poisoned");
        match dir {
            StreamDir::In => {
                let mut file = fs::File::open(&self.path).map_err(|e| io_err(&self.path, e))?;
                let meta = self.read_header(&mut file)?;
                inner.meta = Some(meta.with_stream_dir(StreamDir::In));
                inner.file = Some(file);
            }
            StreamDir::Out => {
                let meta = inner.meta.ok_or_else(|| {
                    IrError::invalid(format!(
                        "{}: metadata must be set before opening for output",
                        self.path.display()
                    ))
                })?;
                let mut file = fs::File::create(&self.path).map_err(|e| io_err(&self.path, e))?;
                self.write_header(&mut file, &meta)?;
                inner.file = Some(file);
            }
            _ => {
                return Err(IrError::invalid(format!(
                    "{}: binary rasters open as In or Out only",
                    self.path.display()
                )));
            }
        }
        inner.dir = dir;
        debug!("opened {} for {:?}", self.path.display(), dir);
        Ok(())
    }

    fn read_block(&self, coord: Coord) -> IrResult<Vec<u8>> {
        let mut inner = self.inner.lock().expect("raster file lock poisoned");
        let meta = inner
            .meta
            .ok_or_else(|| IrError::invalid(format!("{}: not open", self.path.display())))?;
        let len = block_bytes(&meta);
        let offset = Self::header_len(meta.num_dim().rank()) + block_index(&meta, coord)? * len;
        let file = inner
            .file
            .as_mut()
            .ok_or_else(|| IrError::invalid(format!("{}: not open", self.path.display())))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| io_err(&self.path, e))?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf).map_err(|e| io_err(&self.path, e))?;
        Ok(buf)
    }

    fn write_block(&self, coord: Coord, data: &[u8]) -> IrResult<()> {
        let mut inner = self.inner.lock().expect("raster file lock poisoned");
        let meta = inner
            .meta
            .ok_or_else(|| IrError::invalid(format!("{}: not open", self.path.display())))?;
        let len = block_bytes(&meta);
        if data.len() as u64 != len {
            return Err(IrError::invalid(format!(
                "{}: block is {len} bytes, got {}",
                self.path.display(),
                data.len()
            )));
        }
        let offset = Self::header_len(meta.num_dim().rank()) + block_index(&meta, coord)? * len;
        let file = inner
            .file
            .as_mut()
            .ok_or_else(|| IrError::invalid(format!("{}: not open", self.path.display())))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| io_err(&self.path, e))?;
        file.write_all(data).map_err(|e| io_err(&self.path, e))
    }
}

struct ScratchInner {
    file: tempfile::NamedTempFile,
    meta: Option<MetaData>,
}

/// Checkpoint scratch storage; the temporary file disappears with the last
/// handle.
pub struct ScratchFile {
    path: PathBuf,
    inner: Mutex<ScratchInner>,
}

impl std::fmt::Debug for ScratchFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScratchFile").field("path", &self.path).finish()
    }
}

impl RasterFile for ScratchFile {
    fn path(&self) -> &Path {
        &self.path
    }

    fn format(&self) -> FileFormat {
        FileFormat::Scratch
    }

    fn metadata(&self) -> IrResult<MetaData> {
        let inner = self.inner.lock().expect("raster file lock poisoned");
        inner
            .meta
            .ok_or_else(|| IrError::invalid("scratch raster: metadata not set"))
    }

    fn set_metadata(&self, meta: MetaData, dir: StreamDir) -> IrResult<()> {
        let mut inner = self.inner.lock().expect("raster file lock poisoned");
        inner.meta = Some(meta.with_stream_dir(dir));
        Ok(())
    }

    fn open(&self, _dir: StreamDir) -> IrResult<()> {
        // Scratch files are born open.
        Ok(())
    }

    fn read_block(&self, coord: Coord) -> IrResult<Vec<u8>> {
        let mut inner = self.inner.lock().expect("raster file lock poisoned");
        let meta = inner
            .meta
            .ok_or_else(|| IrError::invalid("scratch raster: metadata not set"))?;
        let len = block_bytes(&meta);
        let offset = block_index(&meta, coord)? * len;
        let file = inner.file.as_file_mut();
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| io_err(&self.path, e))?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf).map_err(|e| io_err(&self.path, e))?;
        Ok(buf)
    }

    fn write_block(&self, coord: Coord, data: &[u8]) -> IrResult<()> {
        let mut inner = self.inner.lock().expect("raster file lock poisoned");
        let meta = inner
            .meta
            .ok_or_else(|| IrError::invalid("scratch raster: metadata not set"))?;
        let len = block_bytes(&meta);
        if data.len() as u64 != len {
            return Err(IrError::invalid(format!(
                "scratch raster: block is {len} bytes, got {}",
                data.len()
            )));
        }
        let offset = block_index(&meta, coord)? * len;
        let file = inner.file.as_file_mut();
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| io_err(&self.path, e))?;
        file.write_all(data).map_err(|e| io_err(&self.path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::DataSize;

    fn meta_4x4() -> MetaData {
        MetaData::new(
            Coord::new(&[4, 4]),
            DataType::U8,
            MemOrder::RowPos,
            Coord::new(&[2, 2]),
        )
    }

    #[test]
    fn unknown_suffix_is_rejected() {
        let err = factory(Path::new("dem.xyz")).unwrap_err();
        assert!(matches!(err, IrError::FileFormatUnknown(_)));
    }

    #[test]
    fn bin_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");

        let out = factory(&path).unwrap();
        out.set_metadata(meta_4x4(), StreamDir::Out).unwrap();
        out.open(StreamDir::Out).unwrap();
        out.write_block(Coord::new(&[0, 1]), &[7, 7, 7, 7]).unwrap();
        out.write_block(Coord::new(&[1, 0]), &[9, 9, 9, 9]).unwrap();
        drop(out);

        let inp = factory(&path).unwrap();
        inp.open(StreamDir::In).unwrap();
        let meta = inp.metadata().unwrap();
        assert_eq!(meta.data_size(), DataSize::new(&[4, 4]));
        assert_eq!(meta.data_type(), DataType::U8);
        assert_eq!(meta.stream_dir(), StreamDir::In);
        assert_eq!(inp.read_block(Coord::new(&[0, 1])).unwrap(), vec![7; 4]);
        assert_eq!(inp.read_block(Coord::new(&[1, 0])).unwrap(), vec![9; 4]);
    }

    #[test]
    fn out_of_grid_block_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.bin");
        let out = factory(&path).unwrap();
        out.set_metadata(meta_4x4(), StreamDir::Out).unwrap();
        out.open(StreamDir::Out).unwrap();
        assert!(out.write_block(Coord::new(&[2, 0]), &[0; 4]).is_err());
    }

    #[test]
    fn scratch_round_trip() {
        let file = scratch().unwrap();
        file.set_metadata(meta_4x4(), StreamDir::Io).unwrap();
        assert_eq!(file.format(), FileFormat::Scratch);
        file.write_block(Coord::new(&[1, 1]), &[3, 1, 4, 1]).unwrap();
        assert_eq!(
            file.read_block(Coord::new(&[1, 1])).unwrap(),
            vec![3, 1, 4, 1]
        );
    }
}
