use std::io;
use std::path::Path;

pub(crate) fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Create the pool file, optionally refusing to overwrite an existing one,
/// and fsync the parent directory so the entry itself is durable.
pub(crate) fn create_file(
    path: &Path,
    allow_existing: bool,
) -> io::Result<std::fs::File> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true);
    options.read(true);

    if allow_existing {
        options.create(true);
    } else {
        options.create_new(true);
    }

    let file = options.open(path)?;

    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            std::fs::OpenOptions::new()
                .read(true)
                .open(parent)?
                .sync_all()?;
        }
    }

    Ok(file)
}
