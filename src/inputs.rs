//! Turning command-line paths into conversion tasks.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use mf_av::mp3::VIDEO_EXTENSIONS;
use mf_av::output_path_for;
use mf_batch::BatchTask;
use mf_core::EncodingOptions;

/// Expand directories to the video files directly inside them, sorted by
/// path. Plain paths are passed through even if they don't exist, so the
/// encoder can report them as failed items.
pub fn expand_inputs(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut found: Vec<PathBuf> = WalkDir::new(path)
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.into_path())
                .filter(|p| is_video_file(p))
                .collect();
            found.sort();
            tracing::debug!(dir = %path.display(), files = found.len(), "Expanded directory");
            files.extend(found);
        } else {
            files.push(path.clone());
        }
    }
    files
}

fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| VIDEO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

pub fn build_tasks(
    files: Vec<PathBuf>,
    output_dir: Option<&Path>,
    options: &EncodingOptions,
) -> Vec<BatchTask> {
    files
        .into_iter()
        .map(|input| {
            let output = output_path_for(&input, output_dir);
            BatchTask::new(input, output, options.clone())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn directories_expand_to_sorted_video_files() {
        let dir = tempdir().unwrap();
        for name in ["b.mkv", "a.MP4", "notes.txt", "c.mov"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("d.mp4"), b"x").unwrap();

        let files = expand_inputs(&[dir.path().to_path_buf()]);
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.MP4", "b.mkv", "c.mov"]);
    }

    #[test]
    fn files_pass_through_in_order() {
        let paths = vec![PathBuf::from("/nope/z.mp4"), PathBuf::from("/nope/a.avi")];
        assert_eq!(expand_inputs(&paths), paths);
    }

    #[test]
    fn tasks_target_output_dir() {
        let tasks = build_tasks(
            vec![PathBuf::from("/videos/clip.mp4")],
            Some(Path::new("/out")),
            &EncodingOptions::default(),
        );
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].output, PathBuf::from("/out/clip.mp3"));
    }
}
