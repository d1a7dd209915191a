use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// A note file on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub path: PathBuf,
    pub relative_path: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub created: DateTime<Utc>,
}

impl FileInfo {
    pub fn from_path(path: &Path, root: &Path) -> AppResult<Self> {
        let metadata = std::fs::metadata(path)
            .map_err(|_| AppError::FileNotFound(path.to_string_lossy().to_string()))?;
        let modified: DateTime<Utc> = metadata
            .modified()
            .map(DateTime::from)
            .unwrap_or_else(|_| Utc::now());
        // Not every filesystem records a birth time.
        let created = metadata.created().map(DateTime::from).unwrap_or(modified);

        Ok(Self {
            name: path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
            path: path.to_path_buf(),
            relative_path: relative_to(path, root),
            size: metadata.len(),
            modified,
            created,
        })
    }

    /// Placeholder for a path that is being edited before it exists on disk.
    pub fn unsaved(path: &Path, root: &Path) -> Self {
        let now = Utc::now();
        Self {
            name: path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
            path: path.to_path_buf(),
            relative_path: relative_to(path, root),
            size: 0,
            modified: now,
            created: now,
        }
    }

    /// The same file under a new path.
    pub fn moved_to(&self, path: &Path, root: &Path) -> Self {
        Self {
            name: path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
            path: path.to_path_buf(),
            relative_path: relative_to(path, root),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileTreeNode {
    File(FileInfo),
    Directory {
        name: String,
        path: PathBuf,
        relative_path: String,
        children: Vec<FileTreeNode>,
    },
}

/// Flatten a tree into its files in walk order; directories are dropped.
pub fn flatten_tree(nodes: &[FileTreeNode]) -> Vec<FileInfo> {
    let mut files = Vec::new();
    collect_files(nodes, &mut files);
    files
}

fn collect_files(nodes: &[FileTreeNode], out: &mut Vec<FileInfo>) {
    for node in nodes {
        match node {
            FileTreeNode::File(info) => out.push(info.clone()),
            FileTreeNode::Directory { children, .. } => collect_files(children, out),
        }
    }
}

/// The user's note directory.
pub struct Vault {
    root: PathBuf,
    exclude: GlobSet,
    max_file_size: u64,
}

impl Vault {
    pub fn open(root: impl AsRef<Path>, exclude_patterns: &[String], max_file_size: usize) -> AppResult<Self> {
        let root = root.as_ref();
        let canonical = dunce::canonicalize(root).map_err(|_| {
            AppError::FileNotFound(format!("Vault does not exist: {}", root.display()))
        })?;
        if !canonical.is_dir() {
            return Err(AppError::BadRequest(format!(
                "Vault path is not a directory: {}",
                canonical.display()
            )));
        }

        let mut builder = GlobSetBuilder::new();
        for pattern in exclude_patterns {
            let glob = Glob::new(pattern)
                .map_err(|e| AppError::BadRequest(format!("Invalid exclude pattern '{}': {}", pattern, e)))?;
            builder.add(glob);
        }
        let exclude = builder
            .build()
            .map_err(|e| AppError::BadRequest(format!("Invalid exclude patterns: {}", e)))?;

        Ok(Self {
            root: canonical,
            exclude,
            max_file_size: max_file_size as u64,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walk the vault into a tree of directories and note files.
    /// Hidden entries, excluded directories, `.gitignore`d paths and
    /// oversized files are left out.
    pub fn list_files(&self) -> AppResult<Vec<FileTreeNode>> {
        let root = self.root.clone();
        let exclude = self.exclude.clone();

        let walker = WalkBuilder::new(&self.root)
            .hidden(true)
            .git_ignore(true)
            .git_global(false)
            .git_exclude(true)
            .require_git(false)
            .max_depth(Some(32))
            .sort_by_file_name(|a, b| a.cmp(b))
            .filter_entry(move |entry| {
                if entry.depth() == 0 {
                    return true;
                }
                let name = entry.file_name().to_string_lossy();
                let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
                if is_dir && crate::config::is_excluded_directory(&name) {
                    return false;
                }
                !exclude.is_match(relative_to(entry.path(), &root))
            })
            .build();

        // stack[n] is the open directory holding entries of depth n + 1.
        let mut stack: Vec<DirFrame> = vec![DirFrame::new(String::new(), self.root.clone())];

        for result in walker {
            let entry = match result {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!("Skipping unreadable vault entry: {}", e);
                    continue;
                }
            };
            let depth = entry.depth();
            if depth == 0 {
                continue;
            }
            while stack.len() > depth {
                close_frame(&mut stack, &self.root);
            }

            let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
            if is_dir {
                stack.push(DirFrame::new(
                    entry.file_name().to_string_lossy().to_string(),
                    entry.path().to_path_buf(),
                ));
                continue;
            }

            if !entry.file_type().is_some_and(|ft| ft.is_file()) || !Self::is_note(entry.path()) {
                continue;
            }
            match FileInfo::from_path(entry.path(), &self.root) {
                Ok(info) if info.size <= self.max_file_size => {
                    if let Some(top) = stack.last_mut() {
                        top.children.push(FileTreeNode::File(info));
                    }
                }
                Ok(info) => {
                    tracing::debug!(path = %info.relative_path, size = info.size, "Skipping oversized note");
                }
                Err(e) => tracing::debug!("Skipping {}: {}", entry.path().display(), e),
            }
        }

        while stack.len() > 1 {
            close_frame(&mut stack, &self.root);
        }
        Ok(stack.pop().map(|f| f.children).unwrap_or_default())
    }

    /// All note files in the vault, flattened.
    pub fn list_flat(&self) -> AppResult<Vec<FileInfo>> {
        Ok(flatten_tree(&self.list_files()?))
    }

    pub fn file_info(&self, path: &Path) -> AppResult<FileInfo> {
        FileInfo::from_path(path, &self.root)
    }

    pub fn is_note(path: &Path) -> bool {
        path.extension()
            .map(|e| crate::config::is_supported_extension(&e.to_string_lossy()))
            .unwrap_or(false)
    }

    /// Whether a single path would be picked up by `list_files`: a note
    /// inside the vault, outside hidden and excluded directories, not
    /// matched by an exclude pattern and within the size limit.
    pub fn is_indexable(&self, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(&self.root) else {
            return false;
        };
        if !Self::is_note(path) {
            return false;
        }
        let hidden_or_excluded = relative.components().any(|c| {
            let name = c.as_os_str().to_string_lossy();
            name.starts_with('.') || crate::config::is_excluded_directory(&name)
        });
        if hidden_or_excluded || self.exclude.is_match(relative_to(path, &self.root)) {
            return false;
        }
        std::fs::metadata(path)
            .map(|m| m.is_file() && m.len() <= self.max_file_size)
            .unwrap_or(false)
    }

    /// Resolve a vault-relative (or absolute) path and make sure it stays
    /// inside the vault. The file itself does not have to exist yet.
    pub fn validate_path(&self, file_path: &str) -> AppResult<PathBuf> {
        let candidate = Path::new(file_path);
        let full_path = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };

        let canonical = dunce::canonicalize(&full_path)
            .or_else(|_| {
                // For files that don't exist yet, validate parent
                if let Some(parent) = full_path.parent() {
                    dunce::canonicalize(parent)
                        .map(|p| p.join(full_path.file_name().unwrap_or_default()))
                } else {
                    Err(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "Invalid path",
                    ))
                }
            })
            .map_err(|_| AppError::FileNotFound(file_path.to_string()))?;

        if !canonical.starts_with(&self.root) {
            return Err(AppError::PathNotAllowed(format!(
                "Path '{}' is outside the vault",
                file_path
            )));
        }

        Ok(canonical)
    }

    /// Resolve a path that may no longer exist (index rows of deleted notes
    /// or directories) without touching the filesystem. `..` is refused.
    pub fn resolve_path(&self, file_path: &str) -> AppResult<PathBuf> {
        let candidate = Path::new(file_path);
        let relative = match candidate.strip_prefix(&self.root) {
            Ok(rest) => rest,
            Err(_) if candidate.is_absolute() => {
                return Err(AppError::PathNotAllowed(format!(
                    "Path '{}' is outside the vault",
                    file_path
                )));
            }
            Err(_) => candidate,
        };

        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(AppError::PathNotAllowed(format!(
                        "Path '{}' is outside the vault",
                        file_path
                    )));
                }
            }
        }
        Ok(resolved)
    }
}

struct DirFrame {
    name: String,
    path: PathBuf,
    children: Vec<FileTreeNode>,
}

impl DirFrame {
    fn new(name: String, path: PathBuf) -> Self {
        Self {
            name,
            path,
            children: Vec::new(),
        }
    }
}

/// Pop the innermost open directory and attach it to its parent.
fn close_frame(stack: &mut Vec<DirFrame>, root: &Path) {
    if let Some(done) = stack.pop() {
        let node = FileTreeNode::Directory {
            relative_path: relative_to(&done.path, root),
            name: done.name,
            path: done.path,
            children: done.children,
        };
        if let Some(parent) = stack.last_mut() {
            parent.children.push(node);
        }
    }
}

fn relative_to(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}
