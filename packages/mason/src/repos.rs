//! Repository resolution and working-tree materialisation.
//!
//! A definition names its source as `(repo, ref)` where `repo` is a symbolic
//! alias and `ref` a branch, tag, or commit. Before a cache key can be
//! frozen the ref must resolve to an immutable tree identity; this module
//! answers that question from the tree cache server when possible and from a
//! local bare mirror otherwise, and it materialises working trees out of the
//! same mirrors for builds.

use std::{
    io::Cursor,
    path::{Path, PathBuf},
    sync::Arc,
};

use color_eyre::{
    Result, Section, SectionExt,
    eyre::{Context, OptionExt, bail, eyre},
};
use futures::{FutureExt, future::BoxFuture};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, instrument, trace, warn};

use crate::{
    error::Fault,
    fs,
    keys::TreeSource,
    settings::Settings,
    tree::{self, MAGIC_TIMESTAMP},
};

/// Alias prefixes rewritten to canonical remote URLs.
const ALIASES: &[(&str, &str)] = &[
    ("upstream:", "git://git.baserock.org/delta/"),
    ("baserock:baserock/", "git://git.baserock.org/baserock/baserock/"),
    ("freedesktop:", "git://anongit.freedesktop.org/"),
    ("github:", "git://github.com/"),
    ("gnome:", "git://git.gnome.org/"),
];

/// Expand a symbolic repo alias to its canonical URL.
///
/// A trailing `.git` is stripped; already-canonical URLs pass through.
pub fn repo_url(repo: &str) -> String {
    let mut url = String::from(repo);
    for (alias, base) in ALIASES {
        if let Some(rest) = repo.strip_prefix(alias) {
            url = format!("{base}{rest}");
            break;
        }
    }
    if url.ends_with(".git") {
        url.truncate(url.len() - 4);
    }
    url
}

/// Map a repo coordinate to the filesystem-safe mirror directory name.
///
/// Every character outside `[0-9A-Za-z%_]` becomes `_`.
///
/// NOTE: this must stay byte-for-byte identical to the quoting routine of
/// the mirror publisher, or published tarballs stop being found.
pub fn repo_name(repo: &str) -> String {
    repo_url(repo)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '%' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Wire format of the tree cache server response.
#[derive(Debug, Deserialize)]
struct TreeResponse {
    tree: String,
}

/// Resolves symbolic refs to trees and materialises working trees.
#[derive(Clone, Debug)]
pub struct Resolver {
    settings: Arc<Settings>,
    http: reqwest::Client,
}

impl Resolver {
    /// Create a resolver over the run's settings.
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            http: reqwest::Client::new(),
        }
    }

    /// The local bare mirror directory for `repo`.
    pub fn gitdir(&self, repo: &str) -> PathBuf {
        self.settings.gits.join(repo_name(repo))
    }

    /// Resolve `(repo, ref)` to a tree identity.
    ///
    /// When no local mirror exists yet, the tree cache server is consulted
    /// first so that a fresh worker does not clone just to compute keys. Any
    /// failure there falls back to mirroring and resolving locally.
    #[instrument(skip(self))]
    pub async fn resolve_tree(&self, name: &str, repo: &str, reference: &str) -> Result<String> {
        let gitdir = self.gitdir(repo);
        if fs::metadata(&gitdir).await?.is_none() {
            if self.settings.cache_server_url.is_some() {
                match self.query_tree_server(repo, reference).await {
                    Ok(tree) => return Ok(tree),
                    Err(err) => {
                        warn!(%name, %reference, ?err, "no tree from cache server");
                    }
                }
            }
            self.mirror(name, repo).await.map_err(|err| {
                err.wrap_err(Fault::SourceUnresolvable {
                    repo: String::from(repo),
                    reference: String::from(reference),
                })
            })?;
        }

        let probe = format!("{reference}^{{object}}");
        if !git_ok(&gitdir, &["rev-parse", "--quiet", "--verify", &probe]).await? {
            // The ref is not known locally; maybe it appeared upstream.
            let _ = git(&gitdir, &["fetch", "origin"]).await;
        }

        let peel = format!("{reference}^{{tree}}");
        let output = git(&gitdir, &["rev-parse", &peel]).await?;
        if output.status.success() {
            let tree = String::from_utf8(output.stdout)
                .context("tree id is not utf8")?
                .trim()
                .to_string();
            trace!(%name, %tree, "resolved tree locally");
            Ok(tree)
        } else {
            Err(Fault::SourceUnresolvable {
                repo: String::from(repo),
                reference: String::from(reference),
            })
            .context(format!("resolve '{reference}' in mirror {gitdir:?}"))
            .with_section(|| {
                String::from_utf8_lossy(&output.stderr)
                    .to_string()
                    .header("Git stderr:")
            })
        }
    }

    #[instrument(skip(self))]
    async fn query_tree_server(&self, repo: &str, reference: &str) -> Result<String> {
        let base = self
            .settings
            .cache_server_url
            .as_ref()
            .ok_or_eyre("no tree cache server configured")?;
        let url = format!("{base}repo={}&ref={reference}", repo_url(repo));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("send tree query")?;
        if !response.status().is_success() {
            bail!("tree query returned {}", response.status());
        }
        let parsed: TreeResponse = response.json().await.context("parse tree response")?;
        trace!(tree = %parsed.tree, "tree from cache server");
        Ok(parsed.tree)
    }

    /// Mirror `repo` into the gits directory.
    ///
    /// The published bare-repo tarball is tried first; failing that, a full
    /// `git clone --mirror`. A mirror that appears concurrently (another
    /// worker won the race) is treated as usable.
    #[instrument(skip(self))]
    pub async fn mirror(&self, name: &str, repo: &str) -> Result<()> {
        let gitdir = self.gitdir(repo);
        let url = repo_url(repo);
        fs::create_dir_all(&self.settings.gits).await?;

        match self.mirror_from_tarball(&gitdir, repo).await {
            Ok(()) => {}
            Err(err) => {
                debug!(%name, %url, ?err, "tarball mirror unavailable, cloning");
                fs::remove_dir_all(&gitdir).await?;
                let gitdir_arg = gitdir.display().to_string();
                let output = git(
                    &self.settings.gits,
                    &["clone", "--mirror", "-n", &url, &gitdir_arg],
                )
                .await?;
                if !output.status.success() {
                    // Tolerate creation races: a sibling worker may have
                    // mirrored this repo while we were trying.
                    if fs::metadata(&gitdir.join("HEAD")).await?.is_some() {
                        debug!(%name, ?gitdir, "mirror appeared concurrently");
                    } else {
                        return Err(eyre!("git clone failed for {url}")).with_section(|| {
                            String::from_utf8_lossy(&output.stderr)
                                .to_string()
                                .header("Git stderr:")
                        });
                    }
                }
            }
        }

        debug!(%name, ?gitdir, "git repo mirrored");
        Ok(())
    }

    async fn mirror_from_tarball(&self, gitdir: &Path, repo: &str) -> Result<()> {
        let base = self
            .settings
            .tarball_server_url
            .as_ref()
            .ok_or_eyre("no tarball server configured")?;
        let tar_name = format!("{}.tar", repo_name(repo));
        let url = base.join(&tar_name).context("build tarball url")?;
        debug!(%url, "fetching mirror tarball");

        let bytes = self
            .http
            .get(url)
            .send()
            .await
            .context("fetch tarball")?
            .error_for_status()
            .context("tarball not available")?
            .bytes()
            .await
            .context("read tarball body")?;

        fs::create_dir_all(gitdir).await?;
        let unpack_into = gitdir.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            tar::Archive::new(Cursor::new(bytes))
                .unpack(&unpack_into)
                .context("unpack mirror tarball")
        })
        .await
        .context("join task")??;

        git_expect(gitdir, &["config", "remote.origin.url", &repo_url(repo)]).await?;
        git_expect(gitdir, &["config", "remote.origin.mirror", "true"]).await?;
        git_expect(gitdir, &["config", "remote.origin.fetch", "+refs/*:refs/*"]).await?;
        git_expect(gitdir, &["fetch", "origin"]).await?;
        Ok(())
    }

    /// Materialise a working tree for `(repo, ref)` at `dest`.
    ///
    /// The mirror is copied in as `.git`, converted back into a traditional
    /// clone, and the requested ref checked out. Submodules recorded for
    /// the ref are checked out recursively at their pinned commits. Mtimes
    /// across the result are normalised to the magic timestamp.
    pub fn checkout<'a>(
        &'a self,
        name: &'a str,
        repo: &'a str,
        reference: &'a str,
        dest: &'a Path,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let gitdir = self.gitdir(repo);
            if fs::metadata(&gitdir).await?.is_none() {
                self.mirror(name, repo).await?;
            }
            let version = self.upstream_version(repo, reference).await;
            debug!(%name, %version, ?dest, "checkout");

            self.copy_mirror(&gitdir, dest).await?;
            let output = git(dest, &["checkout", reference]).await?;
            if !output.status.success() {
                return Err(Fault::SourceUnresolvable {
                    repo: String::from(repo),
                    reference: String::from(reference),
                })
                .context(format!("git checkout of '{reference}' in {dest:?}"))
                .with_section(|| {
                    String::from_utf8_lossy(&output.stderr)
                        .to_string()
                        .header("Git stderr:")
                });
            }

            for submodule in self.submodules(name, reference, dest).await? {
                let target = dest.join(&submodule.path);
                self.checkout(&submodule.name, &submodule.url, &submodule.commit, &target)
                    .await?;
            }

            tree::set_mtime_recursively(dest, MAGIC_TIMESTAMP).await?;
            Ok(())
        }
        .boxed()
    }

    /// Copy the bare mirror into `dest/.git` and fix it up for work trees.
    ///
    /// It does not leave any given branch ready for use; `checkout` does.
    async fn copy_mirror(&self, gitdir: &Path, dest: &Path) -> Result<()> {
        let dotgit = dest.join(".git");
        tree::copy_tree(gitdir, &dotgit).await.context("copy mirror")?;

        // core.bare off so git believes work trees are possible; drop the
        // mirror flag and restore a traditional refs/heads -> origin mapping.
        // The origin URL points at the mirror so later fetches stay local.
        git_expect(dest, &["config", "core.bare", "false"]).await?;
        let _ = git(dest, &["config", "--unset", "remote.origin.mirror"]).await;
        git_expect(
            dest,
            &[
                "config",
                "remote.origin.fetch",
                "+refs/heads/*:refs/remotes/origin/*",
            ],
        )
        .await?;
        let gitdir_arg = gitdir.display().to_string();
        git_expect(dest, &["config", "remote.origin.url", &gitdir_arg]).await?;
        git_expect(dest, &["pack-refs", "--all", "--prune"]).await?;

        let packed = dotgit.join("packed-refs");
        if let Some(content) = fs::read_utf8(&packed).await? {
            fs::write(&packed, remap_packed_refs(&content)).await?;
        }

        let _ = git(dest, &["remote", "update", "origin", "--prune"]).await;
        Ok(())
    }

    /// Resolve the submodules recorded for `reference` in a working tree.
    ///
    /// Entries whose tree object is not a commit, or whose hash is
    /// malformed, are skipped with a warning; an unparseable `.gitmodules`
    /// is a source resolution failure.
    #[instrument(skip(self))]
    pub async fn submodules(
        &self,
        name: &str,
        reference: &str,
        checkout: &Path,
    ) -> Result<Vec<Submodule>> {
        let Some(content) = fs::read_utf8(&checkout.join(".gitmodules")).await? else {
            return Ok(Vec::new());
        };
        let entries = parse_gitmodules(&content)
            .map_err(|err| {
                err.wrap_err(Fault::SourceUnresolvable {
                    repo: String::from(name),
                    reference: String::from(reference),
                })
            })
            .context("parse .gitmodules")?;

        let mut resolved = Vec::new();
        for entry in entries {
            let output = git(checkout, &["ls-tree", reference, &entry.path]).await?;
            if !output.status.success() {
                return Err(Fault::SourceUnresolvable {
                    repo: String::from(name),
                    reference: String::from(reference),
                })
                .context(format!("list tree entry for submodule '{}'", entry.name));
            }
            let listing = String::from_utf8_lossy(&output.stdout);
            match parse_ls_tree_commit(listing.trim()) {
                Some(commit) => resolved.push(Submodule { commit, ..entry }),
                None => {
                    warn!(
                        %name,
                        submodule = %entry.name,
                        "skipping submodule: tree entry is not a commit object",
                    );
                }
            }
        }
        Ok(resolved)
    }

    /// Best-effort `<ref> (<tag> + <n> commits)` annotation for logging.
    pub async fn upstream_version(&self, repo: &str, reference: &str) -> String {
        let short: String = reference.chars().take(8).collect();
        let fallback = format!("{short} (no tag found)");
        let gitdir = self.gitdir(repo);

        let Ok(output) = git(&gitdir, &["describe", "--abbrev=0", "--tags", reference]).await
        else {
            return fallback;
        };
        if !output.status.success() {
            return fallback;
        }
        let tag = String::from_utf8_lossy(&output.stdout).trim().to_string();

        let range = format!("{tag}..{reference}");
        let Ok(output) = git(&gitdir, &["rev-list", &range, "--count"]).await else {
            return fallback;
        };
        if !output.status.success() {
            return fallback;
        }
        let commits = String::from_utf8_lossy(&output.stdout).trim().to_string();
        format!("{short} ({tag} + {commits} commits)")
    }
}

impl TreeSource for Resolver {
    fn tree<'a>(
        &'a self,
        name: &'a str,
        repo: &'a str,
        reference: &'a str,
    ) -> BoxFuture<'a, Result<String>> {
        self.resolve_tree(name, repo, reference).boxed()
    }
}

/// One `.gitmodules` entry, with the commit resolved from the parent tree.
#[derive(Clone, Debug)]
pub struct Submodule {
    /// The submodule name from the section header.
    pub name: String,
    /// The remote URL recorded for the submodule.
    pub url: String,
    /// The path of the submodule within the parent tree.
    pub path: String,
    /// The commit the parent tree pins.
    pub commit: String,
}

/// Turn `refs/heads/*` into `refs/remotes/origin/*` in a packed-refs file,
/// dropping any pre-existing remote refs, so a copied mirror behaves like a
/// traditional clone.
pub fn remap_packed_refs(content: &str) -> String {
    let mut lines = content.lines();
    let mut out = String::new();
    if let Some(header) = lines.next() {
        out.push_str(header);
        out.push('\n');
    }
    for line in lines {
        if line.contains(" refs/remotes/") {
            continue;
        }
        if line.len() > 41 && line.as_bytes()[40] == b' ' {
            let (sha, reference) = (&line[..40], &line[41..]);
            if let Some(branch) = reference.strip_prefix("refs/heads/") {
                out.push_str(sha);
                out.push_str(" refs/remotes/origin/");
                out.push_str(branch);
                out.push('\n');
                continue;
            }
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

fn parse_gitmodules(content: &str) -> Result<Vec<Submodule>> {
    let mut entries = Vec::new();
    let mut current: Option<(String, Option<String>, Option<String>)> = None;

    let mut finish = |current: &mut Option<(String, Option<String>, Option<String>)>|
     -> Result<()> {
        if let Some((name, url, path)) = current.take() {
            let url = url.ok_or_else(|| eyre!("submodule '{name}' has no url"))?;
            let path = path.ok_or_else(|| eyre!("submodule '{name}' has no path"))?;
            entries.push(Submodule {
                name,
                url,
                path,
                commit: String::new(),
            });
        }
        Ok(())
    };

    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[') {
            let section = section
                .strip_suffix(']')
                .ok_or_else(|| eyre!("malformed section header: {line}"))?;
            finish(&mut current)?;
            let name = section
                .strip_prefix("submodule \"")
                .and_then(|rest| rest.strip_suffix('"'))
                .ok_or_else(|| eyre!("not a submodule section: [{section}]"))?;
            current = Some((String::from(name), None, None));
        } else if let Some((key, value)) = line.split_once('=') {
            let Some((_, url, path)) = current.as_mut() else {
                bail!("key outside a submodule section: {line}");
            };
            match key.trim() {
                "url" => *url = Some(String::from(value.trim())),
                "path" => *path = Some(String::from(value.trim())),
                _ => {}
            }
        } else {
            bail!("malformed line in .gitmodules: {line}");
        }
    }
    finish(&mut current)?;
    Ok(entries)
}

/// Parse the `<mode> commit <sha>` prefix of an `ls-tree` line, returning
/// the commit hash when present and well-formed.
fn parse_ls_tree_commit(line: &str) -> Option<String> {
    let mut fields = line.split_whitespace();
    let _mode = fields.next()?;
    if fields.next()? != "commit" {
        return None;
    }
    let sha = fields.next()?;
    let well_formed = sha.len() == 40 && sha.chars().all(|c| c.is_ascii_hexdigit());
    well_formed.then(|| String::from(sha))
}

async fn git(dir: &Path, args: &[&str]) -> Result<std::process::Output> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .with_context(|| format!("run git {args:?}"))?;
    trace!(?dir, ?args, status = ?output.status, "git");
    Ok(output)
}

async fn git_ok(dir: &Path, args: &[&str]) -> Result<bool> {
    Ok(git(dir, args).await?.status.success())
}

async fn git_expect(dir: &Path, args: &[&str]) -> Result<std::process::Output> {
    let output = git(dir, args).await?;
    if !output.status.success() {
        return Err(eyre!("git {args:?} failed in {dir:?}")).with_section(|| {
            String::from_utf8_lossy(&output.stderr)
                .to_string()
                .header("Git stderr:")
        });
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn aliases_expand_and_git_suffix_strips() {
        assert_eq!(repo_url("upstream:glibc"), "git://git.baserock.org/delta/glibc");
        assert_eq!(repo_url("github:foo/bar.git"), "git://github.com/foo/bar");
        assert_eq!(
            repo_url("git://example.org/thing"),
            "git://example.org/thing",
        );
    }

    #[test]
    fn sanitised_names_match_the_publisher_routine() {
        // Hand-expanded through the reference quoting rules: everything
        // outside [0-9A-Za-z%_] becomes '_'.
        assert_eq!(
            repo_name("upstream:glibc"),
            "git___git_baserock_org_delta_glibc",
        );
        assert_eq!(
            repo_name("git://example.org/100%_pure"),
            "git___example_org_100%_pure",
        );
    }

    #[test]
    fn distinct_urls_mapping_to_one_name_share_a_mirror() {
        // The sanitiser is lossy on purpose; both of these must land in the
        // same mirror directory.
        assert_eq!(repo_name("github:a/b"), repo_name("github:a.b"));
    }

    #[test]
    fn packed_refs_remap_to_traditional_clone_shape() {
        let input = "\
# pack-refs with: peeled fully-peeled sorted\n\
1111111111111111111111111111111111111111 refs/heads/main\n\
2222222222222222222222222222222222222222 refs/remotes/origin/old\n\
3333333333333333333333333333333333333333 refs/tags/v1.0\n";
        let expected = "\
# pack-refs with: peeled fully-peeled sorted\n\
1111111111111111111111111111111111111111 refs/remotes/origin/main\n\
3333333333333333333333333333333333333333 refs/tags/v1.0\n";
        assert_eq!(remap_packed_refs(input), expected);
    }

    #[test]
    fn ls_tree_commit_lines_parse_from_stdout() {
        let commit = "160000 commit 0123456789012345678901234567890123456789\tvendor/lib";
        assert_eq!(
            parse_ls_tree_commit(commit).as_deref(),
            Some("0123456789012345678901234567890123456789"),
        );

        let blob = "100644 blob 0123456789012345678901234567890123456789\tREADME";
        assert_eq!(parse_ls_tree_commit(blob), None);

        let truncated = "160000 commit 0123456789\tvendor/lib";
        assert_eq!(parse_ls_tree_commit(truncated), None, "malformed hash skips");
    }

    #[test]
    fn gitmodules_sections_parse_with_indentation() {
        let content = "\
[submodule \"vendor/lib\"]\n\
\tpath = vendor/lib\n\
\turl = git://example.org/lib.git\n\
[submodule \"docs\"]\n\
  url = git://example.org/docs\n\
  path = docs\n";
        let entries = parse_gitmodules(content).expect("parse gitmodules");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "vendor/lib");
        assert_eq!(entries[0].url, "git://example.org/lib.git");
        assert_eq!(entries[1].path, "docs");
    }

    #[test]
    fn gitmodules_parse_errors_are_fatal() {
        assert!(parse_gitmodules("path = dangling\n").is_err());
        assert!(parse_gitmodules("[submodule \"x\"]\nurl = only-url\n").is_err());
    }
}
