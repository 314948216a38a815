//! Base service: plugins, server temporary directory, file transfers,
//! object descriptions and runtime configuration trees.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use walkdir::WalkDir;

use dpf_core::{runtime_config, update_runtime_config, ObjectKind};

use crate::msg::{
    DataTreeGetRequest, DataTreeListRequest, DataTreeSetRequest, DescribeRequest, DownloadChunk,
    DownloadFolderRequest, DownloadRequest, Method, PluginRequest, RuntimeClientConfigRequest,
    RuntimeCoreConfigRequest, TmpDirRequest, UploadChunk, UploadResponse,
};
use crate::operator::Operator;
use crate::registry::Handle;
use crate::session::Capability;
use crate::{Error, Result, Session};

/// Entry point looked up in plugin libraries when none is given.
pub const DEFAULT_LOADER_SYMBOL: &str = "LoadOperators";

/// Name of the server operator generating client code for a plugin.
const CODE_GENERATOR_OPERATOR: &str = "python_generator";

/// Joins server path components with forward slashes, which every server
/// platform accepts.
fn server_join(dir: &str, rel: &Path) -> String {
    let mut path = dir.trim_end_matches(|c| c == '/' || c == '\\').to_string();
    for component in rel.components() {
        if let Component::Normal(part) = component {
            path.push('/');
            path.push_str(&part.to_string_lossy());
        }
    }
    path
}

/// Local path of a file received during a folder download, relative to
/// `local_dir`. Server paths may use either separator.
fn local_target(local_dir: &Path, server_dir: &str, server_path: &str) -> Result<PathBuf> {
    let norm = |s: &str| s.replace('\\', "/");
    let dir = norm(server_dir);
    let dir = dir.trim_end_matches('/');
    let path = norm(server_path);
    let rel = path.strip_prefix(dir).unwrap_or(&path);
    let mut target = local_dir.to_path_buf();
    let mut pushed = false;
    for part in rel.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(Error::InvalidArgument(format!(
                    "server path escapes the download folder: {}",
                    server_path
                )))
            }
            part => {
                target.push(part);
                pushed = true;
            }
        }
    }
    if !pushed {
        return Err(Error::InvalidArgument(format!(
            "server sent a chunk without a file name: {}",
            server_path
        )));
    }
    Ok(target)
}

fn has_extension(path: &str, ext: Option<&str>) -> bool {
    match ext {
        None => true,
        Some(ext) => {
            let ext = ext.trim_start_matches('.');
            Path::new(path)
                .extension()
                .map(|e| e.to_string_lossy().eq_ignore_ascii_case(ext))
                .unwrap_or(false)
        }
    }
}

/// Reads a file as a sequence of upload frames of at most `chunk_size`
/// bytes each.
struct UploadFrames<'a> {
    session: &'a Session,
    file: File,
    server_file_path: String,
    use_tmp_dir: bool,
    chunk_size: usize,
    done: bool,
}

impl<'a> UploadFrames<'a> {
    fn read_chunk(&mut self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }
}

impl<'a> Iterator for UploadFrames<'a> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let data = match self.read_chunk() {
            Ok(data) => data,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        if data.len() < self.chunk_size {
            self.done = true;
        }
        if data.is_empty() {
            return None;
        }
        Some(self.session.encode(&UploadChunk {
            server_file_path: self.server_file_path.clone(),
            use_tmp_dir: self.use_tmp_dir,
            data,
        }))
    }
}

/// Writes the chunks of a download stream, rotating output files when the
/// path tag changes.
struct FolderWriter<'a> {
    local_dir: &'a Path,
    server_dir: &'a str,
    ext: Option<&'a str>,
    current: Option<(String, Option<(PathBuf, BufWriter<File>)>)>,
    written: Vec<PathBuf>,
}

impl<'a> FolderWriter<'a> {
    fn write(&mut self, chunk: DownloadChunk) -> Result<()> {
        let rotate = match &self.current {
            Some((tag, _)) => *tag != chunk.server_file_path,
            None => true,
        };
        if rotate {
            self.finish_current()?;
            let out = if has_extension(&chunk.server_file_path, self.ext) {
                let target = local_target(self.local_dir, self.server_dir, &chunk.server_file_path)?;
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                trace!("receiving {} into {}", chunk.server_file_path, target.display());
                let file = BufWriter::new(File::create(&target)?);
                Some((target, file))
            } else {
                trace!("skipping {}", chunk.server_file_path);
                None
            };
            self.current = Some((chunk.server_file_path.clone(), out));
        }
        if let Some((_, Some((_, file)))) = &mut self.current {
            file.write_all(&chunk.data)?;
        }
        Ok(())
    }

    fn finish_current(&mut self) -> Result<()> {
        if let Some((_, Some((path, mut file)))) = self.current.take() {
            file.flush()?;
            self.written.push(path);
        }
        Ok(())
    }

    /// Removes the file being written, if any.
    fn discard_current(&mut self) {
        if let Some((_, Some((path, file)))) = self.current.take() {
            drop(file);
            if let Err(e) = fs::remove_file(&path) {
                warn!("failed removing partial file {}: {}", path.display(), e);
            }
        }
    }
}

impl Session {
    /// Fails with `VersionUnsupported` if the server lacks `capability`.
    pub fn require_capability(&self, capability: Capability) -> Result<()> {
        if self.supports(capability) {
            Ok(())
        } else {
            Err(Error::VersionUnsupported {
                required: capability.min_version().to_string(),
                actual: self.version().to_string(),
            })
        }
    }

    /// Loads a plugin library on the server.
    pub fn load_library(&self, path: &str, name: &str, symbol: Option<&str>) -> Result<()> {
        self.rpc(&PluginRequest {
            name: name.to_string(),
            dll_path: path.to_string(),
            symbol: symbol.unwrap_or(DEFAULT_LOADER_SYMBOL).to_string(),
        })?;
        info!("loaded plugin {} from {}", name, path);
        Ok(())
    }

    /// Loads a plugin library, then asks the server to generate client code
    /// for its operators and downloads it into `out_dir`.
    ///
    /// Only loading the library can fail, a failed generation is logged and
    /// yields no files.
    pub fn load_library_and_generate(
        &self,
        path: &str,
        name: &str,
        symbol: Option<&str>,
        out_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        self.load_library(path, name, symbol)?;
        match self.generate_plugin_code(path, name, out_dir) {
            Ok(files) => Ok(files),
            Err(e) => {
                warn!("code generation for plugin {} failed: {}", name, e);
                Ok(Vec::new())
            }
        }
    }

    fn generate_plugin_code(&self, path: &str, name: &str, out_dir: &Path) -> Result<Vec<PathBuf>> {
        let tmp = self.make_tmp_dir()?;
        let generator = Operator::new(self, CODE_GENERATOR_OPERATOR)?;
        generator.connect(0, path)?;
        generator.connect(1, tmp.as_str())?;
        generator.connect(2, name)?;
        generator.run()?;
        self.download_files_in_folder(&server_join(&tmp, Path::new(name)), out_dir, None)
    }

    /// Server-side temporary directory of this session. The directory is
    /// created on first use and the same path is returned afterwards.
    pub fn make_tmp_dir(&self) -> Result<String> {
        let mut tmp_dir = self.inner().tmp_dir.lock()?;
        if let Some(dir) = tmp_dir.as_ref() {
            return Ok(dir.clone());
        }
        let dir = self.rpc(&TmpDirRequest {})?.v;
        debug!("server tmp dir: {}", dir);
        *tmp_dir = Some(dir.clone());
        Ok(dir)
    }

    /// Uploads a local file, returning its path on the server. With
    /// `to_tmp` the server path is taken relative to the server's temporary
    /// directory.
    pub fn upload_file(&self, local: &Path, remote: &str, to_tmp: bool) -> Result<String> {
        let len = fs::metadata(local)?.len();
        if len == 0 {
            return Err(Error::EmptyFile(local.display().to_string()));
        }
        let chunk_size = runtime_config().default_file_chunk_size as usize;
        let mut frames = UploadFrames {
            session: self,
            file: File::open(local)?,
            server_file_path: remote.to_string(),
            use_tmp_dir: to_tmp,
            chunk_size: chunk_size.max(1),
            done: false,
        };
        let reply = self.client_stream(Method::UploadFile, &mut frames)?;
        let response: UploadResponse = self.decode(&reply.body)?;
        info!(
            "uploaded {} ({} bytes) to {}",
            local.display(),
            len,
            response.server_file_path
        );
        Ok(response.server_file_path)
    }

    /// Downloads a server file. Nothing is left behind at `local` if the
    /// transfer fails.
    pub fn download_file(&self, remote: &str, local: &Path) -> Result<()> {
        let stream = self.server_stream(
            Method::DownloadFile,
            &DownloadRequest {
                server_file_path: remote.to_string(),
                chunk_size: runtime_config().default_file_chunk_size,
            },
        )?;
        let mut file = BufWriter::new(File::create(local)?);
        let result = (|| -> Result<u64> {
            let mut written = 0u64;
            for chunk in stream {
                let chunk: DownloadChunk = self.decode(&chunk?)?;
                file.write_all(&chunk.data)?;
                written += chunk.data.len() as u64;
            }
            file.flush()?;
            Ok(written)
        })();
        match result {
            Ok(written) => {
                info!("downloaded {} ({} bytes) to {}", remote, written, local.display());
                Ok(())
            }
            Err(e) => {
                drop(file);
                if let Err(rm) = fs::remove_file(local) {
                    warn!("failed removing partial file {}: {}", local.display(), rm);
                }
                Err(e)
            }
        }
    }

    /// Downloads the content of a server folder into `local_dir`, keeping
    /// the sub-folder layout. With `ext` only files with that extension are
    /// written. Returns the paths of the written files.
    pub fn download_files_in_folder(
        &self,
        remote_dir: &str,
        local_dir: &Path,
        ext: Option<&str>,
    ) -> Result<Vec<PathBuf>> {
        self.require_capability(Capability::FolderTransfer)?;
        fs::create_dir_all(local_dir)?;
        let stream = self.server_stream(
            Method::DownloadFilesInFolder,
            &DownloadFolderRequest {
                server_folder_path: remote_dir.to_string(),
                chunk_size: runtime_config().default_file_chunk_size,
            },
        )?;
        let mut writer = FolderWriter {
            local_dir,
            server_dir: remote_dir,
            ext,
            current: None,
            written: Vec::new(),
        };
        for chunk in stream {
            let result = chunk
                .and_then(|bytes| self.decode::<DownloadChunk>(&bytes))
                .and_then(|chunk| writer.write(chunk));
            if let Err(e) = result {
                writer.discard_current();
                return Err(e);
            }
        }
        writer.finish_current()?;
        info!(
            "downloaded {} files from {} to {}",
            writer.written.len(),
            remote_dir,
            local_dir.display()
        );
        Ok(writer.written)
    }

    /// Uploads the content of a local folder into `remote_dir`, keeping the
    /// sub-folder layout. Empty files are skipped. Returns the server paths
    /// of the uploaded files.
    pub fn upload_files_in_folder(
        &self,
        remote_dir: &str,
        local_dir: &Path,
        ext: Option<&str>,
    ) -> Result<Vec<String>> {
        let mut uploaded = Vec::new();
        for entry in WalkDir::new(local_dir).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if !has_extension(&path.to_string_lossy(), ext) {
                continue;
            }
            if entry.metadata().map_err(|e| Error::Io(e.into()))?.len() == 0 {
                warn!("skipping empty file {}", path.display());
                continue;
            }
            let rel = path.strip_prefix(local_dir).unwrap_or(path);
            let remote = server_join(remote_dir, rel);
            uploaded.push(self.upload_file(path, &remote, false)?);
        }
        Ok(uploaded)
    }

    /// Server-side textual description of an object.
    pub fn describe(&self, handle: &Handle) -> Result<String> {
        if !handle.belongs_to(self) {
            return Err(Error::InvalidArgument(format!(
                "{} {} belongs to another session",
                handle.kind(),
                handle.id()
            )));
        }
        Ok(self.rpc(&DescribeRequest { id: handle.id() })?.v)
    }

    /// Configuration of the server core, such as its thread count.
    pub fn get_runtime_core_config(&self) -> Result<RuntimeCoreConfig> {
        self.require_capability(Capability::RuntimeConfig)?;
        Ok(RuntimeCoreConfig {
            tree: ConfigTree::new(self.rpc_handle(&RuntimeCoreConfigRequest {})?)?,
        })
    }

    /// Configuration of the client layer as recorded on the server.
    pub fn get_runtime_client_config(&self) -> Result<RuntimeClientConfig> {
        self.require_capability(Capability::RuntimeConfig)?;
        Ok(RuntimeClientConfig {
            tree: ConfigTree::new(self.rpc_handle(&RuntimeClientConfigRequest {})?)?,
        })
    }
}

/// Server-side data tree of string options.
#[derive(Debug)]
struct ConfigTree {
    handle: Handle,
}

impl ConfigTree {
    fn new(handle: Handle) -> Result<Self> {
        if handle.kind() != ObjectKind::DataTree {
            return Err(Error::TypeMismatch {
                pin: -1,
                expected: ObjectKind::DataTree.type_name().to_string(),
                got: handle.kind().type_name().to_string(),
            });
        }
        Ok(Self { handle })
    }

    fn get(&self, name: &str) -> Result<Option<String>> {
        let session = self.handle.session()?;
        Ok(session
            .rpc(&DataTreeGetRequest {
                id: self.handle.id(),
                name: name.to_string(),
            })?
            .value)
    }

    fn get_as<T: FromStr>(&self, name: &str) -> Result<Option<T>> {
        match self.get(name)? {
            Some(s) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| Error::ParseError(format!("option {} has invalid value {}", name, s))),
            None => Ok(None),
        }
    }

    fn set(&self, name: &str, value: &str) -> Result<()> {
        let session = self.handle.session()?;
        session.rpc(&DataTreeSetRequest {
            id: self.handle.id(),
            name: name.to_string(),
            value: value.to_string(),
        })?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<(String, String)>> {
        let session = self.handle.session()?;
        Ok(session
            .rpc(&DataTreeListRequest {
                id: self.handle.id(),
            })?
            .entries)
    }
}

/// Mutable view over the server core configuration.
#[derive(Debug)]
pub struct RuntimeCoreConfig {
    tree: ConfigTree,
}

impl RuntimeCoreConfig {
    pub fn get(&self, name: &str) -> Result<Option<String>> {
        self.tree.get(name)
    }

    pub fn set(&self, name: &str, value: &str) -> Result<()> {
        self.tree.set(name, value)
    }

    pub fn options(&self) -> Result<Vec<(String, String)>> {
        self.tree.list()
    }

    pub fn num_threads(&self) -> Result<Option<u32>> {
        self.tree.get_as("num_threads")
    }

    pub fn set_num_threads(&self, n: u32) -> Result<()> {
        self.tree.set("num_threads", &n.to_string())
    }

    pub fn license_timeout_in_seconds(&self) -> Result<Option<f64>> {
        self.tree.get_as("license_timeout_in_seconds")
    }

    pub fn set_license_timeout_in_seconds(&self, secs: f64) -> Result<()> {
        self.tree
            .set("license_timeout_in_seconds", &secs.to_string())
    }
}

/// Mutable view over the client configuration recorded on the server.
/// Options set through the view also apply to the process-wide runtime
/// configuration.
#[derive(Debug)]
pub struct RuntimeClientConfig {
    tree: ConfigTree,
}

impl RuntimeClientConfig {
    pub fn get(&self, name: &str) -> Result<Option<String>> {
        self.tree.get(name)
    }

    /// Sets an option on the server and locally. Unknown names and invalid
    /// values are rejected before anything is sent.
    pub fn set(&self, name: &str, value: &str) -> Result<()> {
        let mut updated = runtime_config();
        updated.set_option(name, value)?;
        self.tree.set(name, value)?;
        update_runtime_config(move |c| *c = updated)?;
        Ok(())
    }

    pub fn options(&self) -> Result<Vec<(String, String)>> {
        self.tree.list()
    }

    pub fn cache_enabled(&self) -> Result<Option<bool>> {
        self.tree.get_as("use_cache")
    }

    pub fn set_cache_enabled(&self, enabled: bool) -> Result<()> {
        self.set("use_cache", &enabled.to_string())
    }

    pub fn streaming_buffer_size(&self) -> Result<Option<u64>> {
        self.tree.get_as("streaming_buffer_size")
    }

    pub fn set_streaming_buffer_size(&self, size: u64) -> Result<()> {
        self.set("streaming_buffer_size", &size.to_string())
    }

    pub fn stream_floats_instead_of_doubles(&self) -> Result<Option<bool>> {
        self.tree.get_as("stream_floats_instead_of_doubles")
    }

    pub fn set_stream_floats_instead_of_doubles(&self, enabled: bool) -> Result<()> {
        self.set("stream_floats_instead_of_doubles", &enabled.to_string())
    }

    pub fn return_arrays(&self) -> Result<Option<bool>> {
        self.tree.get_as("return_arrays")
    }

    pub fn set_return_arrays(&self, enabled: bool) -> Result<()> {
        self.set("return_arrays", &enabled.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_paths_use_forward_slashes() {
        assert_eq!(
            server_join("/tmp/dpf/", Path::new("a/b.txt")),
            "/tmp/dpf/a/b.txt"
        );
        assert_eq!(server_join("C:\\tmp", Path::new("b.txt")), "C:\\tmp/b.txt");
    }

    #[test]
    fn folder_targets_keep_layout() {
        let local = Path::new("/out");
        assert_eq!(
            local_target(local, "/srv/run", "/srv/run/sub/res.rst").unwrap(),
            PathBuf::from("/out/sub/res.rst")
        );
        assert_eq!(
            local_target(local, "C:\\srv\\run", "C:\\srv\\run\\res.rst").unwrap(),
            PathBuf::from("/out/res.rst")
        );
        assert!(local_target(local, "/srv", "/srv/../etc/passwd").is_err());
        assert!(local_target(local, "/srv", "/srv/").is_err());
    }

    #[test]
    fn extension_filter() {
        assert!(has_extension("/a/b.txt", Some("txt")));
        assert!(has_extension("/a/b.TXT", Some(".txt")));
        assert!(!has_extension("/a/b.rst", Some("txt")));
        assert!(has_extension("/a/b", None));
    }
}
