//! 路径安全校验：目录穿越、系统目录拦截与上传目录约束。

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// 默认拒绝访问的顶级系统目录（`opt` 由部署策略决定是否加入）。
pub const DEFAULT_SYSTEM_DIRS: &[&str] = &[
    "bin", "boot", "dev", "etc", "home", "lib", "lib64", "media", "proc", "root", "run", "sbin",
    "srv", "sys", "tmp", "usr", "var",
];

#[derive(Clone, Debug)]
pub struct PathGuard {
    system_dirs: HashSet<String>,
}

impl PathGuard {
    pub fn new<I, S>(system_dirs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            system_dirs: system_dirs
                .into_iter()
                .map(Into::into)
                .filter(|dir: &String| !dir.is_empty())
                .collect(),
        }
    }

    /// 校验路径：解析符号链接与 `..` 后拒绝系统目录；可选要求目标为普通文件。
    pub async fn validate(&self, path: &Path, check_existence: bool) -> bool {
        let Some(resolved) = resolve_path(path).await else {
            debug!(path = ?path, "path could not be resolved");
            return false;
        };
        if let Some(top) = top_level_segment(&resolved)
            && self.system_dirs.contains(top)
        {
            debug!(path = ?resolved, top, "path is inside a system directory");
            return false;
        }
        if check_existence {
            return matches!(fs::metadata(&resolved).await, Ok(metadata) if metadata.is_file());
        }
        true
    }

    /// 判断 `path` 的规范路径是否位于 `root` 之下（不含 `root` 自身）。
    pub async fn is_contained_in(path: &Path, root: &Path) -> bool {
        let (Some(path), Some(root)) = (resolve_path(path).await, resolve_path(root).await) else {
            return false;
        };
        path != root && path.starts_with(&root)
    }
}

/// 将路径解析为绝对规范形式。
///
/// 存在的最长前缀交给 `canonicalize` 处理（跟随符号链接），其余不存在的部分按字面归一化。
/// 越过文件系统根或任何非 NotFound 的解析错误都视为无效。
async fn resolve_path(path: &Path) -> Option<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(path)
    };
    let components: Vec<Component<'_>> = absolute.components().collect();

    for split in (1..=components.len()).rev() {
        let existing: PathBuf = components[..split].iter().collect();
        match fs::canonicalize(&existing).await {
            Ok(mut resolved) => {
                for component in &components[split..] {
                    match component {
                        Component::Normal(segment) => resolved.push(segment),
                        Component::CurDir => {}
                        Component::ParentDir => {
                            if !resolved.pop() {
                                return None;
                            }
                        }
                        Component::RootDir | Component::Prefix(_) => return None,
                    }
                }
                return Some(resolved);
            }
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => {
                debug!(path = ?existing, error = %err, "canonicalize failed");
                return None;
            }
        }
    }
    None
}

fn top_level_segment(path: &Path) -> Option<&str> {
    path.components().find_map(|component| match component {
        Component::Normal(segment) => segment.to_str(),
        _ => None,
    })
}

/// 清理目录名片段：去除首尾空白，空格转下划线，仅保留字母数字、`-`、`_`、`.`。
pub fn valid_filename(name: &str) -> String {
    name.trim()
        .replace(' ', "_")
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect()
}

/// 上传文件名必须是单个普通路径片段。
pub fn plain_file_name(name: &str) -> Option<&str> {
    if name.is_empty() || name.contains(['/', '\\']) {
        return None;
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Some(name),
        _ => None,
    }
}

/// 默认黑名单去掉 `dir` 所在顶层目录后的守卫，测试夹具位于临时目录时使用。
#[cfg(test)]
pub(crate) fn guard_for(dir: &Path) -> PathGuard {
    let canonical = std::fs::canonicalize(dir).expect("canonicalize temp");
    let top = top_level_segment(&canonical).map(str::to_string);
    PathGuard::new(
        DEFAULT_SYSTEM_DIRS
            .iter()
            .filter(|d| Some(**d) != top.as_deref())
            .copied(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn validate_rejects_system_directories() {
        let guard = PathGuard::new(DEFAULT_SYSTEM_DIRS.iter().copied());
        assert!(!guard.validate(Path::new("/etc/passwd"), false).await);
        assert!(!guard.validate(Path::new("/usr/bin/../lib/x"), false).await);
        assert!(!guard.validate(Path::new("/proc/self/status"), true).await);
        assert!(!guard.validate(Path::new("/var/missing/file"), false).await);
    }

    #[tokio::test]
    async fn validate_resolves_traversal_before_denylist() {
        let temp = tempdir().expect("tempdir");
        let guard = guard_for(temp.path());
        let escaping = temp
            .path()
            .join("../../../../../../../../../../etc/hostname");
        assert!(!guard.validate(&escaping, false).await);
    }

    #[tokio::test]
    async fn validate_checks_existence_of_regular_files() {
        let temp = tempdir().expect("tempdir");
        let guard = guard_for(temp.path());
        let file = temp.path().join("a.txt");
        std::fs::write(&file, b"hello").expect("write file");

        assert!(guard.validate(&file, true).await);
        assert!(!guard.validate(temp.path(), true).await);
        assert!(!guard.validate(&temp.path().join("missing.txt"), true).await);
        assert!(guard.validate(&temp.path().join("missing.txt"), false).await);
        assert!(
            guard
                .validate(&temp.path().join("new/dir/../file.bin"), false)
                .await
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn validate_follows_symlinks_into_system_dirs() {
        use std::os::unix::fs::symlink;

        let temp = tempdir().expect("tempdir");
        let guard = guard_for(temp.path());
        let link = temp.path().join("etc-link");
        symlink("/etc", &link).expect("symlink");
        assert!(!guard.validate(&link, false).await);
        assert!(!guard.validate(&link.join("hostname"), true).await);
    }

    #[tokio::test]
    async fn containment_respects_root_boundary() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("uploads");
        std::fs::create_dir_all(root.join("database_db1")).expect("create root");
        let inside = root.join("database_db1/a.txt");
        std::fs::write(&inside, b"x").expect("write inside");
        let outside = temp.path().join("outside.txt");
        std::fs::write(&outside, b"y").expect("write outside");
        let sibling = temp.path().join("uploads-other/a.txt");

        assert!(PathGuard::is_contained_in(&inside, &root).await);
        assert!(PathGuard::is_contained_in(&root.join("database_db1/new.txt"), &root).await);
        assert!(!PathGuard::is_contained_in(&root, &root).await);
        assert!(!PathGuard::is_contained_in(&outside, &root).await);
        assert!(!PathGuard::is_contained_in(&root.join("../outside.txt"), &root).await);
        assert!(!PathGuard::is_contained_in(&sibling, &root).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn containment_follows_symlinks_out_of_root() {
        use std::os::unix::fs::symlink;

        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("uploads");
        std::fs::create_dir_all(&root).expect("create root");
        let outside = temp.path().join("secret.txt");
        std::fs::write(&outside, b"secret").expect("write outside");
        let link = root.join("link.txt");
        symlink(&outside, &link).expect("symlink");

        assert!(!PathGuard::is_contained_in(&link, &root).await);
    }

    #[test]
    fn valid_filename_strips_unsafe_characters() {
        assert_eq!(
            valid_filename("john's portrait in 2004.jpg"),
            "johns_portrait_in_2004.jpg"
        );
        assert_eq!(valid_filename(" ../db/1 "), "..db1");
    }

    #[test]
    fn plain_file_name_rejects_paths() {
        assert_eq!(plain_file_name("report.pdf"), Some("report.pdf"));
        assert_eq!(plain_file_name("../report.pdf"), None);
        assert_eq!(plain_file_name("a/b.txt"), None);
        assert_eq!(plain_file_name(".."), None);
        assert_eq!(plain_file_name(""), None);
    }
}
