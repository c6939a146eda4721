//! Classification of git hook names.

pub const PRE_COMMIT: &str = "pre-commit";
pub const PRE_PUSH: &str = "pre-push";

/// Hooks that also run the matching `git lfs` sub-hook.
const LFS_HOOKS: [&str; 4] = ["post-checkout", "post-commit", "post-merge", PRE_PUSH];

/// Hooks whose jobs operate on the staged file set.
pub fn uses_staged_files(hook: &str) -> bool {
    hook == PRE_COMMIT
}

/// Hooks whose jobs operate on the files about to be pushed.
pub fn uses_push_files(hook: &str) -> bool {
    hook == PRE_PUSH
}

pub fn is_lfs_hook(hook: &str) -> bool {
    LFS_HOOKS.contains(&hook)
}
