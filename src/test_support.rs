#![forbid(unsafe_code)]

//! Helpers shared by unit tests: a wiremock server driven from blocking
//! code and shell script stubs standing in for external tools.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::runtime::{Builder, Runtime};
use wiremock::matchers::{any, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

/// A `MockServer` plus the small runtime used to drive its async API. The
/// server answers on its own thread, so blocking `ureq` calls from the test
/// thread reach it directly.
pub(crate) struct TestServer {
    server: MockServer,
    runtime: Runtime,
}

impl TestServer {
    pub fn new() -> Self {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let server = runtime.block_on(MockServer::start());
        Self { server, runtime }
    }

    /// Answers every request with `responder`.
    pub fn start<F>(responder: F) -> Self
    where
        F: Fn(&Request) -> ResponseTemplate + Send + Sync + 'static,
    {
        let server = Self::new();
        server.mount(Mock::given(any()).respond_with(responder));
        server
    }

    /// Answers known GET paths with a 200 and their body. Unmatched requests
    /// get wiremock's default 404.
    pub fn with_routes(routes: Vec<(&str, Vec<u8>)>) -> Self {
        let server = Self::new();
        for (route, body) in routes {
            server.mount(
                Mock::given(method("GET"))
                    .and(path(route))
                    .respond_with(ResponseTemplate::new(200).set_body_bytes(body)),
            );
        }
        server
    }

    pub fn mount(&self, mock: Mock) {
        self.runtime.block_on(mock.mount(&self.server));
    }

    pub fn host(&self) -> String {
        self.server.address().to_string()
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.server.uri(), path)
    }

    pub fn requests(&self) -> Vec<Request> {
        self.runtime
            .block_on(self.server.received_requests())
            .unwrap_or_default()
    }

    pub fn requests_for(&self, route: &str) -> Vec<Request> {
        self.requests()
            .into_iter()
            .filter(|request| request.url.path() == route)
            .collect()
    }
}

pub(crate) fn header<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
}

/// Writes an executable bash script named `name` into `dir`.
pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/bash\n{body}\n")).unwrap();
    let mut permissions = fs::metadata(&path).unwrap().permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(&path, permissions).unwrap();
    path
}

/// Multiplexer stand-in: the concat pass joins every listed file, the remux
/// pass copies its input. The output is always the last argument.
pub(crate) fn ffmpeg_stub(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "ffmpeg",
        r#"input=""
previous=""
for arg in "$@"; do
  if [ "$previous" = "-i" ]; then input="$arg"; fi
  previous="$arg"
done
output="${@: -1}"
case "$input" in
  *.txt)
    sed -n "s/^file '\(.*\)'$/\1/p" "$input" | while read -r segment; do
      cat "$segment"
    done > "$output"
    ;;
  *)
    cat "$input" > "$output"
    ;;
esac"#,
    )
}
