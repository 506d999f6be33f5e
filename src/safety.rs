//! Pre- and post-execution gates.
//!
//! Pure decision logic, kept separate from the loop so every rule is
//! unit-testable: scope matching, the forbidden-filename policy, and the
//! auto-branch rule.

/// Branches that trigger auto-branching onto a per-task branch.
const PROTECTED_BRANCHES: &[&str] = &["main", "master"];

/// Prefix of automatically created per-task branches.
pub const BRANCH_PREFIX: &str = "feat/ai/";

/// Filenames that may legitimately look like secret carriers.
const FILENAME_EXCEPTIONS: &[&str] = &[".env.example", ".env.template"];

// ---------------------------------------------------------------------------
// Scope matching
// ---------------------------------------------------------------------------

/// Whether `file` is allowed by a single scope entry.
///
/// Three rules, checked in order:
/// 1. exact path match;
/// 2. directory prefix — `file` starts with `entry + "/"`;
/// 3. trailing `/*` — `entry` ends with `/*` and `file` starts with the
///    preceding directory (any depth, unlike a shell glob).
pub fn scope_entry_allows(entry: &str, file: &str) -> bool {
    if file == entry {
        return true;
    }
    if let Some(stripped) = file.strip_prefix(entry)
        && stripped.starts_with('/')
    {
        return true;
    }
    if let Some(dir) = entry.strip_suffix("/*") {
        return file.strip_prefix(dir).is_some_and(|rest| rest.starts_with('/'));
    }
    false
}

/// Whether `file` is allowed by any entry of `scope`.
pub fn scope_allows(scope: &[String], file: &str) -> bool {
    scope.iter().any(|entry| scope_entry_allows(entry, file))
}

/// The subset of `changed` not covered by `scope`, in input order.
pub fn scope_violations(scope: &[String], changed: &[String]) -> Vec<String> {
    changed
        .iter()
        .filter(|file| !scope_allows(scope, file))
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// Forbidden filenames
// ---------------------------------------------------------------------------

/// Whether a created file's name falls under the secretless policy:
/// `.env`, `.env.*`, `*.pem`, `*.key` — minus the documented exceptions.
pub fn is_forbidden_filename(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);

    if FILENAME_EXCEPTIONS.contains(&name) {
        return false;
    }
    name == ".env"
        || name.starts_with(".env.")
        || name.ends_with(".pem")
        || name.ends_with(".key")
}

/// Created files that violate the secretless filename policy.
pub fn forbidden_created_files(created: &[String]) -> Vec<String> {
    created
        .iter()
        .filter(|path| is_forbidden_filename(path))
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// Auto-branching
// ---------------------------------------------------------------------------

/// The per-task branch to create, if the current branch calls for one.
///
/// Work is never committed on `main` or `master`; on those, the task
/// runs on a fresh `feat/ai/<id>` branch. On any other branch the
/// worktree is detached at `HEAD` and the existing branch name is kept
/// in the result.
pub fn auto_branch(current_branch: &str, task_id: &str) -> Option<String> {
    if PROTECTED_BRANCHES.contains(&current_branch) {
        Some(format!("{BRANCH_PREFIX}{task_id}"))
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| (*s).to_owned()).collect()
    }

    // -- scope rules --

    #[test]
    fn exact_match() {
        assert!(scope_allows(&scope(&["src/a.txt"]), "src/a.txt"));
        assert!(!scope_allows(&scope(&["src/a.txt"]), "src/a.txt.bak"));
    }

    #[test]
    fn directory_prefix() {
        let s = scope(&["src"]);
        assert!(scope_allows(&s, "src/a.txt"));
        assert!(scope_allows(&s, "src/sub/deep.rs"));
        assert!(!scope_allows(&s, "srcx/a.txt"));
        assert!(!scope_allows(&s, "other/src/a.txt"));
    }

    #[test]
    fn trailing_star_matches_any_depth() {
        let s = scope(&["src/*"]);
        assert!(scope_allows(&s, "src/a.txt"));
        assert!(scope_allows(&s, "src/sub/b.txt"));
        assert!(!scope_allows(&s, "src"));
        assert!(!scope_allows(&s, "lib/a.txt"));
    }

    #[test]
    fn multiple_entries_are_a_union() {
        let s = scope(&["docs/README.md", "src/*"]);
        assert!(scope_allows(&s, "docs/README.md"));
        assert!(scope_allows(&s, "src/x.rs"));
        assert!(!scope_allows(&s, "docs/other.md"));
    }

    #[test]
    fn violations_preserve_order() {
        let s = scope(&["src/a.txt"]);
        let changed = vec![
            "src/a.txt".to_owned(),
            "README.md".to_owned(),
            "Cargo.toml".to_owned(),
        ];
        assert_eq!(
            scope_violations(&s, &changed),
            vec!["README.md".to_owned(), "Cargo.toml".to_owned()]
        );
    }

    #[test]
    fn no_violations_when_all_in_scope() {
        let s = scope(&["src"]);
        let changed = vec!["src/a.rs".to_owned(), "src/b/c.rs".to_owned()];
        assert!(scope_violations(&s, &changed).is_empty());
    }

    // -- filename policy --

    #[test]
    fn env_files_are_forbidden() {
        assert!(is_forbidden_filename(".env"));
        assert!(is_forbidden_filename(".env.production"));
        assert!(is_forbidden_filename("config/.env"));
        assert!(is_forbidden_filename("deploy/.env.staging"));
    }

    #[test]
    fn env_examples_are_allowed() {
        assert!(!is_forbidden_filename(".env.example"));
        assert!(!is_forbidden_filename(".env.template"));
        assert!(!is_forbidden_filename("config/.env.example"));
    }

    #[test]
    fn key_material_is_forbidden() {
        assert!(is_forbidden_filename("server.pem"));
        assert!(is_forbidden_filename("certs/tls.key"));
        assert!(!is_forbidden_filename("keyboard.rs"));
        assert!(!is_forbidden_filename("monkey.rsx"));
    }

    #[test]
    fn forbidden_created_files_filters() {
        let created = vec![
            "src/ok.rs".to_owned(),
            ".env".to_owned(),
            "certs/ca.pem".to_owned(),
            ".env.example".to_owned(),
        ];
        assert_eq!(
            forbidden_created_files(&created),
            vec![".env".to_owned(), "certs/ca.pem".to_owned()]
        );
    }

    // -- auto branch --

    #[test]
    fn main_and_master_get_task_branch() {
        assert_eq!(auto_branch("main", "t1"), Some("feat/ai/t1".to_owned()));
        assert_eq!(auto_branch("master", "t1"), Some("feat/ai/t1".to_owned()));
    }

    #[test]
    fn feature_branches_are_kept() {
        assert_eq!(auto_branch("feat/login", "t1"), None);
        assert_eq!(auto_branch("HEAD", "t1"), None);
    }
}
