//! XML form of the manifest.
//!
//! `from_bytes . to_bytes` is the identity on defaulted manifests, and
//! `to_bytes . from_bytes` is the identity modulo whitespace on emitted
//! bytes: reading applies default-fill (protocol "git", remotebranch
//! "master", revision "HEAD"), writing elides exactly those defaults and
//! any empty element group. Unknown elements and attributes are parse
//! errors rather than silently dropped, so nothing survives a round trip
//! unnoticed.

use std::path::{Path, PathBuf};

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};

use crate::error::{Error, Result};

use super::{FileImport, Host, HostHook, Hook, Import, Manifest, Project, Tool};

/// Read a manifest file.
pub fn read_manifest(path: &Path) -> Result<Manifest> {
    if !path.exists() {
        return Err(Error::NotFound(path.to_path_buf()));
    }
    let bytes = std::fs::read(path)?;
    from_bytes(&bytes).map_err(|e| match e {
        // Keep the error kind; just anchor parse failures to the file.
        Error::Parse(msg) => Error::Parse(format!("{}: {msg}", path.display())),
        other => other,
    })
}

/// Write a manifest file atomically: temp file in the same directory,
/// then rename, so a reader never observes a partial manifest.
pub fn write_manifest(path: &Path, manifest: &Manifest) -> Result<()> {
    write_atomic(path, &to_bytes(manifest)?)
}

pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;
    let dir = path.parent().ok_or_else(|| {
        Error::message(format!("{} has no parent directory", path.display()))
    })?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(path)
        .map_err(|e| Error::Io(e.error))
        .map(|_| ())
}

/// Parse manifest bytes. The result is defaulted and validated.
pub fn from_bytes(bytes: &[u8]) -> Result<Manifest> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::Parse(format!("manifest is not UTF-8: {e}")))?;
    let text = fold_legacy_project_tags(text);
    let mut parser = Parser::new(&text);
    let mut manifest = parser.manifest()?;
    manifest.fill_defaults()?;
    Ok(manifest)
}

/// Serialise a manifest. Defaults are elided from a working copy; the
/// input is left untouched.
pub fn to_bytes(manifest: &Manifest) -> Result<Vec<u8>> {
    let mut manifest = manifest.clone();
    for project in &mut manifest.projects {
        project.unfill_defaults();
    }

    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut root = BytesStart::new("manifest");
    if let Some(label) = &manifest.label {
        root.push_attribute(("label", label.as_str()));
    }
    writer.write_event(Event::Start(root))?;

    if !manifest.hooks.is_empty() {
        group(&mut writer, "hooks", &manifest.hooks, write_hook)?;
    }
    if !manifest.imports.is_empty() || !manifest.file_imports.is_empty() {
        writer
            .write_event(Event::Start(BytesStart::new("imports")))?;
        for import in &manifest.imports {
            write_import(&mut writer, import)?;
        }
        for file_import in &manifest.file_imports {
            let mut e = BytesStart::new("fileimport");
            e.push_attribute(("file", file_import.file.as_str()));
            writer.write_event(Event::Empty(e))?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("imports")))?;
    }
    if !manifest.projects.is_empty() {
        group(&mut writer, "projects", &manifest.projects, write_project)?;
    }
    if !manifest.tools.is_empty() {
        group(&mut writer, "tools", &manifest.tools, write_tool)?;
    }
    if !manifest.hosts.is_empty() {
        group(&mut writer, "hosts", &manifest.hosts, write_host)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("manifest")))?;
    let mut bytes = writer.into_inner();
    bytes.push(b'\n');
    Ok(bytes)
}

/// Read a standalone project element (the per-project metadata body).
pub fn project_from_bytes(bytes: &[u8]) -> Result<Project> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::Parse(format!("metadata is not UTF-8: {e}")))?;
    let text = fold_legacy_project_tags(text);
    let mut reader = Reader::from_str(&text);
    reader.config_mut().trim_text(true);
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Empty(e) | Event::Start(e) if e.name().as_ref() == b"project" => {
                let mut project = parse_project(&e)?;
                project.fill_defaults()?;
                return Ok(project);
            }
            Event::Decl(_) | Event::Comment(_) | Event::Text(_) => {}
            Event::Eof => return Err(Error::Parse("metadata has no project element".to_string())),
            other => {
                return Err(Error::Parse(format!(
                    "unexpected {other:?} in project metadata"
                )));
            }
        }
    }
}

/// Serialise a standalone project element.
pub fn project_to_bytes(project: &Project) -> Result<Vec<u8>> {
    let mut project = project.clone();
    project.unfill_defaults();
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    write_project(&mut writer, &project)?;
    let mut bytes = writer.into_inner();
    bytes.push(b'\n');
    Ok(bytes)
}

/// Old manifests carry an upper-case project element; fold the tags to
/// lower case before parsing.
fn fold_legacy_project_tags(text: &str) -> String {
    text.replace("<Project ", "<project ")
        .replace("<Project/", "<project/")
        .replace("</Project>", "</project>")
}

fn xml_err(err: quick_xml::Error) -> Error {
    Error::Parse(format!("malformed manifest: {err}"))
}

fn group<W, T>(
    writer: &mut Writer<Vec<u8>>,
    name: &'static str,
    items: &[T],
    write: W,
) -> Result<()>
where
    W: Fn(&mut Writer<Vec<u8>>, &T) -> Result<()>,
{
    writer
        .write_event(Event::Start(BytesStart::new(name)))?;
    for item in items {
        write(writer, item)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

fn push_path_attribute(e: &mut BytesStart, key: &str, path: &Path) {
    e.push_attribute((key, path.to_string_lossy().as_ref()));
}

fn write_project(writer: &mut Writer<Vec<u8>>, project: &Project) -> Result<()> {
    let mut e = BytesStart::new("project");
    e.push_attribute(("name", project.name.as_str()));
    push_path_attribute(&mut e, "path", &project.path);
    if !project.protocol.is_empty() {
        e.push_attribute(("protocol", project.protocol.as_str()));
    }
    e.push_attribute(("remote", project.remote.as_str()));
    if !project.remote_branch.is_empty() {
        e.push_attribute(("remotebranch", project.remote_branch.as_str()));
    }
    if !project.revision.is_empty() {
        e.push_attribute(("revision", project.revision.as_str()));
    }
    if let Some(host) = &project.gerrit_host {
        e.push_attribute(("gerrithost", host.as_str()));
    }
    if let Some(dir) = &project.git_hooks {
        push_path_attribute(&mut e, "githooks", dir);
    }
    if let Some(hook) = &project.run_hook {
        push_path_attribute(&mut e, "runhook", hook);
    }
    writer.write_event(Event::Empty(e))?;
    Ok(())
}

fn write_import(writer: &mut Writer<Vec<u8>>, import: &Import) -> Result<()> {
    let mut e = BytesStart::new("import");
    e.push_attribute(("name", import.name.as_str()));
    if !import.remote.is_empty() {
        e.push_attribute(("remote", import.remote.as_str()));
    }
    if !import.manifest.is_empty() {
        e.push_attribute(("manifest", import.manifest.as_str()));
    }
    if !import.root.is_empty() {
        e.push_attribute(("root", import.root.as_str()));
    }
    if !import.protocol.is_empty() {
        e.push_attribute(("protocol", import.protocol.as_str()));
    }
    if !import.remote_branch.is_empty() {
        e.push_attribute(("remotebranch", import.remote_branch.as_str()));
    }
    writer.write_event(Event::Empty(e))?;
    Ok(())
}

fn write_tool(writer: &mut Writer<Vec<u8>>, tool: &Tool) -> Result<()> {
    let mut e = BytesStart::new("tool");
    e.push_attribute(("name", tool.name.as_str()));
    e.push_attribute(("project", tool.project.as_str()));
    if !tool.package.is_empty() {
        e.push_attribute(("package", tool.package.as_str()));
    }
    if !tool.data.is_empty() {
        e.push_attribute(("data", tool.data.as_str()));
    }
    writer.write_event(Event::Empty(e))?;
    Ok(())
}

fn write_hook(writer: &mut Writer<Vec<u8>>, hook: &Hook) -> Result<()> {
    let mut e = BytesStart::new("hook");
    e.push_attribute(("name", hook.name.as_str()));
    e.push_attribute(("project", hook.project.as_str()));
    push_path_attribute(&mut e, "path", &hook.path);
    if let Some(interpreter) = &hook.interpreter {
        e.push_attribute(("interpreter", interpreter.as_str()));
    }
    if !hook.args.is_empty() {
        e.push_attribute(("args", hook.args.join(" ").as_str()));
    }
    writer.write_event(Event::Empty(e))?;
    Ok(())
}

fn write_host(writer: &mut Writer<Vec<u8>>, host: &Host) -> Result<()> {
    let mut e = BytesStart::new("host");
    e.push_attribute(("name", host.kind.as_str()));
    e.push_attribute(("location", host.location.as_str()));
    if host.git_hooks.is_empty() {
        writer.write_event(Event::Empty(e))?;
        return Ok(());
    }
    writer.write_event(Event::Start(e))?;
    for payload in &host.git_hooks {
        let mut h = BytesStart::new("githook");
        h.push_attribute(("name", payload.name.as_str()));
        push_path_attribute(&mut h, "path", &payload.path);
        writer.write_event(Event::Empty(h))?;
    }
    writer.write_event(Event::End(BytesEnd::new("host")))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Parsing

struct Parser<'a> {
    reader: Reader<&'a [u8]>,
}

/// Attributes of one element, as owned strings.
fn attrs(e: &BytesStart) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| Error::Parse(format!("malformed attribute: {err}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|err| Error::Parse(format!("malformed attribute value: {err}")))?
            .into_owned();
        out.push((key, value));
    }
    Ok(out)
}

fn unknown_attr(element: &str, key: &str) -> Error {
    Error::Parse(format!("unknown attribute {key:?} on <{element}>"))
}

fn parse_project(e: &BytesStart) -> Result<Project> {
    let mut project = Project::default();
    for (key, value) in attrs(e)? {
        match key.as_str() {
            "name" => project.name = value,
            "path" => project.path = PathBuf::from(value),
            "protocol" => project.protocol = value,
            "remote" => project.remote = value,
            "remotebranch" => project.remote_branch = value,
            "revision" => project.revision = value,
            "gerrithost" => project.gerrit_host = Some(value),
            "githooks" => project.git_hooks = Some(PathBuf::from(value)),
            "runhook" => project.run_hook = Some(PathBuf::from(value)),
            other => return Err(unknown_attr("project", other)),
        }
    }
    Ok(project)
}

fn parse_import(e: &BytesStart) -> Result<Import> {
    let mut import = Import::default();
    for (key, value) in attrs(e)? {
        match key.as_str() {
            "name" => import.name = value,
            "remote" => import.remote = value,
            "manifest" => import.manifest = value,
            "root" => import.root = value,
            "protocol" => import.protocol = value,
            "remotebranch" => import.remote_branch = value,
            other => return Err(unknown_attr("import", other)),
        }
    }
    Ok(import)
}

fn parse_file_import(e: &BytesStart) -> Result<FileImport> {
    let mut file_import = FileImport::default();
    for (key, value) in attrs(e)? {
        match key.as_str() {
            "file" => file_import.file = value,
            other => return Err(unknown_attr("fileimport", other)),
        }
    }
    if file_import.file.is_empty() {
        return Err(Error::Parse("fileimport without file attribute".to_string()));
    }
    Ok(file_import)
}

fn parse_tool(e: &BytesStart) -> Result<Tool> {
    let mut tool = Tool::default();
    for (key, value) in attrs(e)? {
        match key.as_str() {
            "name" => tool.name = value,
            "project" => tool.project = value,
            "package" => tool.package = value,
            "data" => tool.data = value,
            other => return Err(unknown_attr("tool", other)),
        }
    }
    Ok(tool)
}

fn parse_hook(e: &BytesStart) -> Result<Hook> {
    let mut hook = Hook::default();
    for (key, value) in attrs(e)? {
        match key.as_str() {
            "name" => hook.name = value,
            "project" => hook.project = value,
            "path" => hook.path = PathBuf::from(value),
            "interpreter" => hook.interpreter = Some(value),
            "args" => hook.args = value.split_whitespace().map(str::to_owned).collect(),
            other => return Err(unknown_attr("hook", other)),
        }
    }
    Ok(hook)
}

fn parse_host(e: &BytesStart) -> Result<Host> {
    let mut host = Host::default();
    for (key, value) in attrs(e)? {
        match key.as_str() {
            "name" => host.kind = value,
            "location" => host.location = value,
            other => return Err(unknown_attr("host", other)),
        }
    }
    Ok(host)
}

fn parse_host_hook(e: &BytesStart) -> Result<HostHook> {
    let mut payload = HostHook::default();
    for (key, value) in attrs(e)? {
        match key.as_str() {
            "name" => payload.name = value,
            "path" => payload.path = PathBuf::from(value),
            other => return Err(unknown_attr("githook", other)),
        }
    }
    Ok(payload)
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(true);
        Parser { reader }
    }

    fn next(&mut self) -> Result<Event<'a>> {
        loop {
            match self.reader.read_event().map_err(xml_err)? {
                Event::Comment(_) | Event::Decl(_) | Event::PI(_) => continue,
                event => return Ok(event),
            }
        }
    }

    fn manifest(&mut self) -> Result<Manifest> {
        let mut manifest = Manifest::default();
        // Root element.
        loop {
            match self.next()? {
                Event::Start(e) if e.name().as_ref() == b"manifest" => {
                    for (key, value) in attrs(&e)? {
                        match key.as_str() {
                            "label" => manifest.label = Some(value),
                            other => return Err(unknown_attr("manifest", other)),
                        }
                    }
                    break;
                }
                Event::Empty(e) if e.name().as_ref() == b"manifest" => {
                    for (key, value) in attrs(&e)? {
                        match key.as_str() {
                            "label" => manifest.label = Some(value),
                            other => return Err(unknown_attr("manifest", other)),
                        }
                    }
                    return Ok(manifest);
                }
                Event::Eof => {
                    return Err(Error::Parse("manifest has no root element".to_string()));
                }
                other => {
                    return Err(Error::Parse(format!(
                        "expected <manifest> root, found {other:?}"
                    )));
                }
            }
        }
        // Child groups, in any order.
        loop {
            match self.next()? {
                Event::Start(e) => {
                    match e.name().as_ref() {
                        b"projects" => self.items(b"projects", b"project", |e| {
                            manifest.projects.push(parse_project(e)?);
                            Ok(())
                        })?,
                        b"imports" => self.imports(&mut manifest)?,
                        b"tools" => self.items(b"tools", b"tool", |e| {
                            manifest.tools.push(parse_tool(e)?);
                            Ok(())
                        })?,
                        b"hooks" => self.items(b"hooks", b"hook", |e| {
                            manifest.hooks.push(parse_hook(e)?);
                            Ok(())
                        })?,
                        b"hosts" => self.hosts(&mut manifest)?,
                        other => {
                            return Err(Error::Parse(format!(
                                "unknown element <{}> in manifest",
                                String::from_utf8_lossy(other)
                            )));
                        }
                    }
                }
                Event::Empty(e) => {
                    // An empty group is the elided form; nothing to ingest.
                    match e.name().as_ref() {
                        b"projects" | b"imports" | b"tools" | b"hooks" | b"hosts" => {}
                        other => {
                            return Err(Error::Parse(format!(
                                "unknown element <{}> in manifest",
                                String::from_utf8_lossy(other)
                            )));
                        }
                    }
                }
                Event::End(e) if e.name().as_ref() == b"manifest" => break,
                Event::Eof => {
                    return Err(Error::Parse("unterminated <manifest> element".to_string()));
                }
                other => {
                    return Err(Error::Parse(format!(
                        "unexpected {other:?} inside <manifest>"
                    )));
                }
            }
        }
        Ok(manifest)
    }

    /// A flat group of empty child elements named `child`.
    fn items(
        &mut self,
        parent: &[u8],
        child: &[u8],
        mut ingest: impl FnMut(&BytesStart) -> Result<()>,
    ) -> Result<()> {
        loop {
            match self.next()? {
                Event::Empty(e) if e.name().as_ref() == child => ingest(&e)?,
                Event::Start(e) if e.name().as_ref() == child => {
                    ingest(&e)?;
                    self.expect_end(child)?;
                }
                Event::End(e) if e.name().as_ref() == parent => return Ok(()),
                other => {
                    return Err(Error::Parse(format!(
                        "unexpected {other:?} inside <{}>",
                        String::from_utf8_lossy(parent)
                    )));
                }
            }
        }
    }

    fn expect_end(&mut self, name: &[u8]) -> Result<()> {
        match self.next()? {
            Event::End(e) if e.name().as_ref() == name => Ok(()),
            other => Err(Error::Parse(format!(
                "expected </{}>, found {other:?}",
                String::from_utf8_lossy(name)
            ))),
        }
    }

    /// The imports group mixes remote and file imports; `localimport` is
    /// the older spelling of `fileimport`.
    fn imports(&mut self, manifest: &mut Manifest) -> Result<()> {
        loop {
            match self.next()? {
                Event::Empty(e) => match e.name().as_ref() {
                    b"import" => manifest.imports.push(parse_import(&e)?),
                    b"fileimport" | b"localimport" => {
                        manifest.file_imports.push(parse_file_import(&e)?)
                    }
                    other => {
                        return Err(Error::Parse(format!(
                            "unknown element <{}> in imports",
                            String::from_utf8_lossy(other)
                        )));
                    }
                },
                Event::End(e) if e.name().as_ref() == b"imports" => return Ok(()),
                other => {
                    return Err(Error::Parse(format!(
                        "unexpected {other:?} inside <imports>"
                    )));
                }
            }
        }
    }

    fn hosts(&mut self, manifest: &mut Manifest) -> Result<()> {
        loop {
            match self.next()? {
                Event::Empty(e) if e.name().as_ref() == b"host" => {
                    manifest.hosts.push(parse_host(&e)?);
                }
                Event::Start(e) if e.name().as_ref() == b"host" => {
                    let mut host = parse_host(&e)?;
                    loop {
                        match self.next()? {
                            Event::Empty(e) if e.name().as_ref() == b"githook" => {
                                host.git_hooks.push(parse_host_hook(&e)?);
                            }
                            Event::End(e) if e.name().as_ref() == b"host" => break,
                            other => {
                                return Err(Error::Parse(format!(
                                    "unexpected {other:?} inside <host>"
                                )));
                            }
                        }
                    }
                    manifest.hosts.push(host);
                }
                Event::End(e) if e.name().as_ref() == b"hosts" => return Ok(()),
                other => {
                    return Err(Error::Parse(format!("unexpected {other:?} inside <hosts>")));
                }
            }
        }
    }
}
