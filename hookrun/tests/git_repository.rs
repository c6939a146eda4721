//! `Git` against real repositories in temp directories.

use std::fs;

use pretty_assertions::assert_eq;

use hookrun::io::git::Git;
use hookrun::io::repository::{Repository, changed_paths};
use hookrun::test_support::TestRepo;

fn setup() -> (TestRepo, Git) {
    let repo = TestRepo::new().expect("test repo");
    let git = Git::new(repo.path());
    (repo, git)
}

#[test]
fn staged_files_exclude_deletions_unless_asked() {
    let (repo, git) = setup();
    repo.write("a.rb", "a\n").expect("write");
    repo.write("b.rb", "b\n").expect("write");
    repo.commit_all("init").expect("commit");

    repo.write("a.rb", "changed\n").expect("write");
    fs::remove_file(repo.path().join("b.rb")).expect("remove");
    repo.write("lib/c.rb", "c\n").expect("write");
    repo.git(&["add", "-A"]).expect("add");

    assert_eq!(git.staged_files().expect("staged"), vec!["a.rb", "lib/c.rb"]);
    assert_eq!(
        git.staged_files_with_deleted().expect("staged"),
        vec!["a.rb", "b.rb", "lib/c.rb"]
    );
    assert_eq!(git.all_files().expect("all"), vec!["a.rb", "lib/c.rb"]);
}

#[test]
fn unstaged_changes_round_trip_through_stash() {
    let (repo, git) = setup();
    repo.write("a.txt", "one\n").expect("write");
    repo.write("b.txt", "plain\n").expect("write");
    repo.commit_all("init").expect("commit");

    repo.write("a.txt", "two\n").expect("write");
    repo.git(&["add", "a.txt"]).expect("add");
    repo.write("a.txt", "three\n").expect("write");
    repo.write("b.txt", "unstaged only\n").expect("write");

    let partial = git.partially_staged_files().expect("partial");
    assert_eq!(partial, vec!["a.txt"]);

    git.save_unstaged(&partial).expect("save");
    git.hide_unstaged(&partial).expect("hide");
    assert_eq!(repo.read("a.txt").expect("read"), "two\n");
    assert_eq!(repo.read("b.txt").expect("read"), "unstaged only\n");

    git.restore_unstaged().expect("restore");
    assert_eq!(repo.read("a.txt").expect("read"), "three\n");
    assert!(repo.git(&["stash", "list"]).expect("list").contains("hookrun auto backup"));

    git.drop_unstaged_stash().expect("drop");
    assert_eq!(repo.git(&["stash", "list"]).expect("list").trim(), "");
    assert_eq!(git.staged_files().expect("staged"), vec!["a.txt"]);
}

#[test]
fn dropping_backup_without_restore_leaves_nothing_behind() {
    let (repo, git) = setup();
    repo.write("a.txt", "one\n").expect("write");
    repo.commit_all("init").expect("commit");
    repo.write("a.txt", "two\n").expect("write");
    repo.git(&["add", "a.txt"]).expect("add");
    repo.write("a.txt", "three\n").expect("write");

    git.save_unstaged(&["a.txt".to_string()]).expect("save");
    let patch = repo.path().join(".git/info/hookrun-unstaged.patch");
    assert!(patch.exists());

    git.drop_unstaged_stash().expect("drop");
    assert!(!patch.exists());
    assert_eq!(repo.git(&["stash", "list"]).expect("list").trim(), "");
    assert_eq!(repo.read("a.txt").expect("read"), "three\n");
}

#[test]
fn changeset_tracks_edits_and_new_files() {
    let (repo, git) = setup();
    repo.write("a.txt", "one\n").expect("write");
    repo.commit_all("init").expect("commit");
    repo.write("a.txt", "two\n").expect("write");

    let before = git.changeset().expect("before");
    let unchanged = git.changeset().expect("again");
    assert!(changed_paths(&before, &unchanged).is_empty());

    repo.write("a.txt", "three\n").expect("write");
    repo.write("new.txt", "new\n").expect("write");
    let after = git.changeset().expect("after");
    assert_eq!(changed_paths(&before, &after), vec!["a.txt", "new.txt"]);
}

#[test]
fn add_files_stages_them() {
    let (repo, git) = setup();
    repo.write("a.txt", "one\n").expect("write");
    repo.commit_all("init").expect("commit");
    repo.write("a.txt", "fixed\n").expect("write");

    git.add_files(&["a.txt".to_string()]).expect("add");
    assert_eq!(git.staged_files().expect("staged"), vec!["a.txt"]);
    assert!(git.partially_staged_files().expect("partial").is_empty());
}

#[test]
fn state_reports_branch_and_plain_head() {
    let (repo, git) = setup();
    repo.write("a.txt", "one\n").expect("write");
    repo.commit_all("init").expect("commit");

    let state = git.state().expect("state");
    assert_eq!(state.branch.as_deref(), Some("main"));
    assert!(!state.merging);
    assert!(!state.rebasing);
    assert!(!state.merge_commit);

    let head = repo.git(&["rev-parse", "HEAD"]).expect("head");
    repo.git(&["checkout", "-q", "--detach", head.trim()])
        .expect("detach");
    assert_eq!(git.state().expect("state").branch, None);
}

#[test]
fn discover_finds_root_from_subdirectory() {
    let (repo, _) = setup();
    repo.write("nested/dir/a.txt", "a\n").expect("write");

    let git = Git::discover(&repo.path().join("nested/dir")).expect("discover");
    assert_eq!(
        fs::canonicalize(git.root()).expect("canonical"),
        fs::canonicalize(repo.path()).expect("canonical")
    );
}

#[cfg(unix)]
#[test]
fn files_command_keeps_existing_files_only() {
    let (repo, git) = setup();
    repo.write("a.rb", "a\n").expect("write");
    repo.write("sub/b.rb", "b\n").expect("write");

    let files = git
        .files_by_command("printf 'a.rb\\nmissing.rb\\nsub\\nsub/b.rb\\n'", None)
        .expect("files");
    assert_eq!(files, vec!["a.rb", "sub/b.rb"]);
    assert!(git.files_by_command("exit 1", None).is_err());
}

#[cfg(unix)]
#[test]
fn files_command_keeps_names_with_spaces() {
    let (repo, git) = setup();
    repo.write("a b.rb", "a\n").expect("write");
    repo.write("c.rb", "c\n").expect("write");

    let files = git
        .files_by_command("printf 'a b.rb\\nc.rb\\n'", None)
        .expect("files");
    assert_eq!(files, vec!["a b.rb", "c.rb"]);
}

#[cfg(unix)]
#[test]
fn files_command_runs_inside_job_root() {
    let (repo, git) = setup();
    repo.write("api/a.rb", "a\n").expect("write");
    repo.write("a.rb", "top\n").expect("write");

    let files = git.files_by_command("ls", Some("api")).expect("files");
    assert_eq!(files, vec!["api/a.rb"]);
    let files = git
        .files_by_command("printf './a.rb\\nmissing.rb\\n'", Some("api/"))
        .expect("files");
    assert_eq!(files, vec!["api/a.rb"]);
}

#[test]
fn spaced_paths_survive_stash_and_change_detection() {
    let (repo, git) = setup();
    repo.write("a b.rb", "one\n").expect("write");
    repo.write("déjà vu.md", "x\n").expect("write");
    repo.commit_all("init").expect("commit");

    repo.write("a b.rb", "two\n").expect("write");
    repo.git(&["add", "a b.rb"]).expect("add");
    repo.write("a b.rb", "three\n").expect("write");

    let partial = git.partially_staged_files().expect("partial");
    assert_eq!(partial, vec!["a b.rb"]);
    git.save_unstaged(&partial).expect("save");
    git.hide_unstaged(&partial).expect("hide");
    assert_eq!(repo.read("a b.rb").expect("read"), "two\n");

    let before = git.changeset().expect("before");
    repo.write("déjà vu.md", "changed\n").expect("write");
    let after = git.changeset().expect("after");
    assert_eq!(changed_paths(&before, &after), vec!["déjà vu.md"]);

    git.restore_unstaged().expect("restore");
    assert_eq!(repo.read("a b.rb").expect("read"), "three\n");
    git.drop_unstaged_stash().expect("drop");
}

#[test]
fn staged_listing_keeps_unicode_names() {
    let (repo, git) = setup();
    repo.write("README.md", "r\n").expect("write");
    repo.commit_all("init").expect("commit");
    repo.write("naïve file.txt", "n\n").expect("write");
    repo.git(&["add", "-A"]).expect("add");
    assert_eq!(git.staged_files().expect("staged"), vec!["naïve file.txt"]);
}

#[cfg(unix)]
#[test]
fn command_conditions_report_exit_status() {
    let (_repo, git) = setup();
    assert!(git.command_succeeds("true").expect("run"));
    assert!(!git.command_succeeds("test -f missing").expect("run"));
}
