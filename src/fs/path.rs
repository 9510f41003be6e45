//! 客户机路径到宿主路径的沙箱转换

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use crate::error::ShimError;

/// 客户机使用的 BSD 风格打开标志
pub mod open_flags {
    pub const O_ACCMODE: u32 = 0x0003;
    pub const O_RDONLY: u32 = 0x0000;
    pub const O_WRONLY: u32 = 0x0001;
    pub const O_RDWR: u32 = 0x0002;
    pub const O_APPEND: u32 = 0x0008;
    pub const O_CREAT: u32 = 0x0200;
    pub const O_TRUNC: u32 = 0x0400;
    pub const O_EXCL: u32 = 0x0800;
}

/// 沙箱路径转换器，根目录在进程初始化时确定
#[derive(Debug, Clone)]
pub struct PathTranslator {
    root: PathBuf,
}

impl PathTranslator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 把客户机路径转换为沙箱根下的宿主路径
    ///
    /// 以分隔符开头和不以分隔符开头的路径都相对沙箱根解析，
    /// `..` 在词法上归一化并停在根处，空路径返回 `NotFound`。
    pub fn to_host_path(&self, guest: &str) -> Result<PathBuf, ShimError> {
        if guest.is_empty() {
            return Err(ShimError::NotFound(String::new()));
        }
        if guest.contains('\0') {
            return Err(ShimError::NotFound(guest.to_string()));
        }

        let mut segments: Vec<&std::ffi::OsStr> = Vec::new();
        for component in Path::new(guest).components() {
            match component {
                Component::Normal(segment) => segments.push(segment),
                Component::ParentDir => {
                    segments.pop();
                }
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            }
        }

        let mut host = self.root.clone();
        host.extend(segments);
        if !host.starts_with(&self.root) {
            return Err(ShimError::PathEscape(host));
        }
        debug!(guest, host = %host.display(), "路径转换");
        Ok(host)
    }

    /// 符号链接解析后仍需位于沙箱根内
    ///
    /// 叶子不存在（例如即将创建）时改为检查最近的已存在祖先。
    fn confined(&self, host: &Path) -> Result<(), ShimError> {
        let Ok(root) = self.root.canonicalize() else {
            // 沙箱根不存在，后续文件操作会报告
            return Ok(());
        };
        for candidate in host.ancestors() {
            match candidate.canonicalize() {
                Ok(real) if real.starts_with(&root) => return Ok(()),
                Ok(real) => {
                    warn!(host = %host.display(), real = %real.display(), "符号链接指向沙箱之外");
                    return Err(ShimError::NotFound(host.display().to_string()));
                }
                // 悬空的符号链接，创建时会跟随到无法确认的位置
                Err(_) if candidate.symlink_metadata().is_ok() => {
                    warn!(host = %host.display(), link = %candidate.display(), "悬空符号链接");
                    return Err(ShimError::NotFound(host.display().to_string()));
                }
                Err(_) => continue,
            }
        }
        Ok(())
    }

    /// 客户机路径是否存在
    pub fn exists(&self, guest: &str) -> bool {
        match self.to_host_path(guest) {
            Ok(host) => self.confined(&host).is_ok() && host.exists(),
            Err(_) => false,
        }
    }

    /// 打开客户机路径对应的宿主文件
    ///
    /// `flags` 使用客户机的 BSD 风格标志，`mode` 只在创建文件时生效。
    pub fn open(&self, guest: &str, flags: u32, mode: u32) -> Result<File, ShimError> {
        let host = match self.to_host_path(guest) {
            Ok(host) => host,
            Err(ShimError::PathEscape(path)) => return Err(ShimError::PathEscape(path)),
            Err(_) => return Err(ShimError::NotFound(guest.to_string())),
        };
        self.confined(&host)?;

        let mut options = OpenOptions::new();
        match flags & open_flags::O_ACCMODE {
            open_flags::O_WRONLY => options.write(true),
            open_flags::O_RDWR => options.read(true).write(true),
            _ => options.read(true),
        };
        if flags & open_flags::O_APPEND != 0 {
            options.append(true);
        }
        if flags & open_flags::O_TRUNC != 0 {
            options.truncate(true);
        }
        if flags & open_flags::O_CREAT != 0 {
            if flags & open_flags::O_EXCL != 0 {
                options.create_new(true);
            } else {
                options.create(true);
            }
            options.mode(mode);
        }

        options.open(&host).map_err(|err| {
            debug!(guest, error = %err, "打开文件失败");
            ShimError::NotFound(guest.to_string())
        })
    }
}
