//! Which repository paths are worth fetching.

/// Lock files carry no useful meaning and are often huge.
const LOCK_FILES: &[&str] = &[
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "bun.lockb",
    "cargo.lock",
    "poetry.lock",
    "composer.lock",
    "gemfile.lock",
];

/// Directories that hold VCS metadata, dependencies or build output.
const IGNORED_DIRS: &[&str] = &[
    "node_modules",
    "target",
    "dist",
    "build",
    "out",
    "coverage",
    "__pycache__",
    "vendor",
    "venv",
    "env",
];

/// Whether the loader should fetch the blob at `path` (a `/`-separated
/// repository path).
pub fn should_fetch(path: &str) -> bool {
    let mut components = path.split('/').peekable();
    while let Some(component) = components.next() {
        let is_file = components.peek().is_none();
        if component.is_empty() {
            return false;
        }
        if component.starts_with('.') {
            return false;
        }
        if !is_file && IGNORED_DIRS.contains(&component) {
            return false;
        }
        if is_file {
            return !is_lock_file(component) && is_indexable_file(component);
        }
    }
    false
}

fn is_lock_file(file_name: &str) -> bool {
    let lower = file_name.to_lowercase();
    LOCK_FILES.contains(&lower.as_str())
}

fn is_indexable_file(file_name: &str) -> bool {
    let lower = file_name.to_lowercase();

    // Common files without a meaningful extension
    if matches!(
        lower.as_str(),
        "makefile"
            | "dockerfile"
            | "rakefile"
            | "gemfile"
            | "procfile"
            | "cmakelists.txt"
            | "readme"
            | "license"
    ) {
        return true;
    }

    let Some((_, ext)) = lower.rsplit_once('.') else {
        return false;
    };

    matches!(
        ext,
        "rs" | "py"
            | "js"
            | "mjs"
            | "cjs"
            | "ts"
            | "tsx"
            | "jsx"
            | "go"
            | "java"
            | "c"
            | "cpp"
            | "cc"
            | "h"
            | "hpp"
            | "cs"
            | "rb"
            | "php"
            | "swift"
            | "kt"
            | "kts"
            | "scala"
            | "r"
            | "lua"
            | "sh"
            | "bash"
            | "zsh"
            | "ps1"
            | "sql"
            | "html"
            | "css"
            | "scss"
            | "less"
            | "xml"
            | "json"
            | "yaml"
            | "yml"
            | "toml"
            | "ini"
            | "cfg"
            | "conf"
            | "md"
            | "mdx"
            | "rst"
            | "txt"
            | "proto"
            | "graphql"
            | "gql"
            | "prisma"
            | "vue"
            | "svelte"
            | "astro"
            | "ex"
            | "exs"
            | "erl"
            | "hs"
            | "ml"
            | "clj"
            | "cljs"
            | "tf"
            | "hcl"
            | "nix"
            | "zig"
            | "dart"
            | "nim"
            | "jl"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_files_are_fetched() {
        assert!(should_fetch("src/main.rs"));
        assert!(should_fetch("app/page.tsx"));
        assert!(should_fetch("README.md"));
        assert!(should_fetch("Dockerfile"));
        assert!(should_fetch("prisma/schema.prisma"));
    }

    #[test]
    fn test_lock_files_are_skipped() {
        assert!(!should_fetch("package-lock.json"));
        assert!(!should_fetch("yarn.lock"));
        assert!(!should_fetch("web/pnpm-lock.yaml"));
        assert!(!should_fetch("bun.lockb"));
        assert!(!should_fetch("Cargo.lock"));
    }

    #[test]
    fn test_dependency_and_build_dirs_are_skipped() {
        assert!(!should_fetch("node_modules/react/index.js"));
        assert!(!should_fetch("target/debug/build.rs"));
        assert!(!should_fetch("packages/ui/dist/index.js"));
        assert!(!should_fetch(".git/config"));
        assert!(!should_fetch(".next/server/app.js"));
    }

    #[test]
    fn test_dir_names_are_only_ignored_as_directories() {
        assert!(should_fetch("src/build.rs"));
        assert!(should_fetch("src/vendor.ts"));
    }

    #[test]
    fn test_binaries_and_hidden_files_are_skipped() {
        assert!(!should_fetch("public/logo.png"));
        assert!(!should_fetch("fonts/inter.woff2"));
        assert!(!should_fetch(".env"));
        assert!(!should_fetch("bin/tool"));
        assert!(!should_fetch(""));
    }
}
