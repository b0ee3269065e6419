use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

use crate::error::{HksError, HksResult};

/// Create `path` (and parents) owner-only. An existing directory is success.
pub fn ensure_secure_dir(path: &Path) -> HksResult<()> {
    match fs::create_dir(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            if !path.is_dir() {
                return Err(HksError::make_dir(path, "exists and is not a directory"));
            }
            return Ok(());
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(path).map_err(|e| HksError::make_dir(path, e))?;
        }
        Err(err) => return Err(HksError::make_dir(path, err)),
    }
    #[cfg(unix)]
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
        .map_err(|e| HksError::make_dir(path, e))?;
    Ok(())
}

/// Open with owner read/write only, tightening the mode of files that already existed.
pub fn open_secure(path: &Path, options: &mut OpenOptions) -> io::Result<File> {
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    let file = options.open(path)?;
    apply_file_permissions(&file)?;
    Ok(file)
}

fn apply_file_permissions(file: &File) -> io::Result<()> {
    #[cfg(unix)]
    {
        let mut perms = file.metadata()?.permissions();
        if perms.mode() & 0o777 != 0o600 {
            perms.set_mode(0o600);
            file.set_permissions(perms)?;
        }
    }
    #[cfg(not(unix))]
    let _ = file;
    Ok(())
}
