//! Plain-text checkpoints for named state tensors.
//!
//! Format: a count line, then per tensor a header line
//! `name ndim dim0 dim1 ...` followed by one value per line. Rust's float
//! formatting round-trips, so the text form is lossless.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::quant::TransplantError;
use crate::Tensor;

pub fn save_state(path: &Path, entries: &[(String, Tensor)]) -> std::io::Result<()> {
    let mut file = BufWriter::new(File::create(path)?);

    writeln!(file, "{}", entries.len())?;
    for (name, tensor) in entries {
        write!(file, "{} {}", name, tensor.shape().len())?;
        for dim in tensor.shape() {
            write!(file, " {}", dim)?;
        }
        writeln!(file)?;

        for value in tensor.data().iter() {
            writeln!(file, "{}", value)?;
        }
    }

    Ok(())
}

pub fn load_state(path: &Path) -> Result<Vec<(String, Tensor)>, Box<dyn std::error::Error>> {
    let file = BufReader::new(
        File::open(path).map_err(|e| format!("failed to open checkpoint {:?}: {}", path, e))?,
    );
    let mut lines = file.lines();

    let mut next_line = || -> Result<String, Box<dyn std::error::Error>> {
        lines
            .next()
            .ok_or_else(|| format!("checkpoint {:?} is truncated", path))?
            .map_err(Into::into)
    };

    let count: usize = next_line()?.trim().parse()?;
    let mut entries = Vec::with_capacity(count);

    for _ in 0..count {
        let header = next_line()?;
        let mut parts = it_fields(&header);
        let name = parts
            .next()
            .ok_or_else(|| format!("checkpoint {:?}: empty tensor header", path))?
            .to_string();
        let ndim: usize = parts
            .next()
            .ok_or_else(|| format!("checkpoint {:?}: header for `{}` lacks rank", path, name))?
            .parse()?;
        let mut shape = Vec::with_capacity(ndim);
        for _ in 0..ndim {
            let dim: usize = parts
                .next()
                .ok_or_else(|| format!("checkpoint {:?}: header for `{}` lacks dims", path, name))?
                .parse()?;
            shape.push(dim);
        }

        let len: usize = shape.iter().product();
        let mut data = Vec::with_capacity(len);
        for _ in 0..len {
            data.push(next_line()?.trim().parse::<f32>()?);
        }

        entries.push((name, Tensor::new(data, &shape)));
    }

    Ok(entries)
}

fn it_fields(line: &str) -> impl Iterator<Item = &str> {
    line.split_whitespace()
}

/// Copy `src` entries into `dest` by name, non-strict: keys missing on
/// either side or with a different shape are skipped. Returns
/// (loaded, skipped) counts over `src`.
pub fn apply_state(dest: &[(String, Tensor)], src: &[(String, Tensor)]) -> (usize, usize) {
    use std::collections::HashMap;
    let by_name: HashMap<&str, &Tensor> =
        dest.iter().map(|(n, t)| (n.as_str(), t)).collect();

    let mut loaded = 0usize;
    let mut skipped = 0usize;
    for (name, tensor) in src {
        match by_name.get(name.as_str()) {
            Some(target) if target.shape() == tensor.shape() => {
                target.copy_from(tensor);
                loaded += 1;
            }
            _ => skipped += 1,
        }
    }
    (loaded, skipped)
}

/// Copy `src` into `dest` by enumeration order, ignoring names. This is the
/// model-zoo contract for filling a freshly built parent network: fragile
/// by design, so the count is checked eagerly and every copy asserts shape
/// equality instead of proceeding silently.
pub fn load_positional(
    dest: &[(String, Tensor)],
    src: &[(String, Tensor)],
) -> Result<(), TransplantError> {
    if dest.len() != src.len() {
        return Err(TransplantError::PositionalMismatch {
            expected: dest.len(),
            found: src.len(),
        });
    }
    for ((_, target), (_, source)) in dest.iter().zip(src.iter()) {
        target.copy_from(source);
    }
    Ok(())
}
