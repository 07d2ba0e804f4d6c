use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::config::DataParam;
use crate::cube::LogicalCube;
use crate::{CnError, CnResult};

/// An image corpus backed by a flat little-endian f32 stream: per image,
/// `n_rows * n_cols * dim` pixels in CRDB order followed by the label as
/// one float. Labels are pulled out into a resident cube when the corpus
/// is opened; pixel data streams through the images cube one mini-batch at
/// a time.
#[derive(Debug)]
pub struct Corpus {
    pub n_rows: usize,
    pub n_cols: usize,
    pub dim: usize,
    pub n_images: usize,
    pub mini_batch_size: usize,
    pub num_mini_batches: usize,
    pub last_batch_size: usize,
    /// One mini-batch worth of pixels, refilled in place per batch.
    pub images: LogicalCube,
    /// Every label in the corpus, `(1, 1, 1, n_images)`.
    pub labels: LogicalCube,
    path: PathBuf,
}

impl Corpus {
    pub fn open(param: &DataParam, path: impl AsRef<Path>) -> CnResult<Self> {
        let path = path.as_ref();
        let image_floats = param.height * param.width * param.channels;
        if image_floats == 0 || param.batch_size == 0 {
            return Err(CnError::Config(
                "data layer dimensions and batch_size must be positive".into(),
            ));
        }
        let record_bytes = (image_floats + 1) as u64 * 4;
        let meta = std::fs::metadata(path)
            .map_err(|e| CnError::Corpus(format!("cannot open {}: {e}", path.display())))?;
        if meta.len() == 0 || meta.len() % record_bytes != 0 {
            return Err(CnError::Corpus(format!(
                "{}: size {} is not a whole number of {}-byte image records",
                path.display(),
                meta.len(),
                record_bytes
            )));
        }
        let n_images = (meta.len() / record_bytes) as usize;
        let mini_batch_size = param.batch_size.min(n_images);
        let num_mini_batches = n_images.div_ceil(mini_batch_size);
        let rem = n_images % mini_batch_size;
        let last_batch_size = if rem == 0 { mini_batch_size } else { rem };

        // One pass over the stream to pull every label into memory.
        let mut labels = LogicalCube::new(1, 1, 1, n_images);
        let mut reader = BufReader::new(File::open(path)?);
        for i in 0..n_images {
            reader.seek_relative(image_floats as i64 * 4)?;
            labels.data_mut()[i] = reader.read_f32::<LittleEndian>()?;
        }

        Ok(Self {
            n_rows: param.height,
            n_cols: param.width,
            dim: param.channels,
            n_images,
            mini_batch_size,
            num_mini_batches,
            last_batch_size,
            images: LogicalCube::new(param.height, param.width, param.channels, mini_batch_size),
            labels,
            path: path.to_path_buf(),
        })
    }

    /// `(R, C, D, B)` of the first layer this corpus feeds.
    pub fn input_shape(&self) -> [usize; 4] {
        [self.n_rows, self.n_cols, self.dim, self.mini_batch_size]
    }

    /// Size of the given mini-batch index.
    pub fn batch_size_of(&self, batch: usize) -> usize {
        if batch + 1 == self.num_mini_batches {
            self.last_batch_size
        } else {
            self.mini_batch_size
        }
    }

    /// Labels of the given mini-batch.
    pub fn batch_labels(&self, batch: usize) -> &[f32] {
        let start = batch * self.mini_batch_size;
        &self.labels.data()[start..start + self.batch_size_of(batch)]
    }

    /// Opens a fresh sequential pass over the stream.
    pub fn reader(&self) -> CnResult<CorpusReader> {
        let file = File::open(&self.path)
            .map_err(|e| CnError::Corpus(format!("cannot open {}: {e}", self.path.display())))?;
        Ok(CorpusReader {
            reader: BufReader::new(file),
            image_floats: self.n_rows * self.n_cols * self.dim,
        })
    }
}

pub struct CorpusReader {
    reader: BufReader<File>,
    image_floats: usize,
}

impl CorpusReader {
    /// Reads the next `batch` image records into the cube's leading slabs,
    /// dropping the interleaved labels (they are resident in the corpus).
    /// A short read surfaces as an I/O error.
    pub fn fill_batch(&mut self, images: &mut LogicalCube, batch: usize) -> CnResult<()> {
        debug_assert!(batch <= images.b);
        for b in 0..batch {
            let slab = &mut images.batch_slice_mut(b)[..self.image_floats];
            self.reader.read_f32_into::<LittleEndian>(slab)?;
            let _label = self.reader.read_f32::<LittleEndian>()?;
        }
        Ok(())
    }
}
