//! Project-type detection and generated Dockerfiles.
//!
//! Which image a repository gets is internal policy of the builder: a
//! web-framework manifest selects the matching language image, a
//! repository that ships its own Dockerfile is built as-is, anything
//! else becomes a static nginx image. Every generated image listens on
//! the deployment's target port so the host mapping is always
//! `port -> port`.

use std::path::Path;

use minijinja::{Environment, context};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectKind {
    /// `package.json` plus an `api/` tree: node frontend + python api.
    Fullstack,
    Node,
    Python,
    Go,
    /// The repository ships its own Dockerfile.
    Dockerfile,
    Static,
}

impl std::fmt::Display for ProjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Fullstack => "fullstack",
            Self::Node => "node",
            Self::Python => "python",
            Self::Go => "go",
            Self::Dockerfile => "docker",
            Self::Static => "static",
        };
        f.write_str(s)
    }
}

/// Manifest-file sniffing over the cloned working tree.
pub fn detect_project_kind(repo: &Path) -> ProjectKind {
    if repo.join("package.json").is_file() && repo.join("api").is_dir() {
        ProjectKind::Fullstack
    } else if repo.join("package.json").is_file() {
        ProjectKind::Node
    } else if repo.join("requirements.txt").is_file() || repo.join("pyproject.toml").is_file() {
        ProjectKind::Python
    } else if repo.join("go.mod").is_file() {
        ProjectKind::Go
    } else if repo.join("Dockerfile").is_file() {
        ProjectKind::Dockerfile
    } else {
        ProjectKind::Static
    }
}

const NODE_TEMPLATE: &str = r#"FROM node:20-alpine
WORKDIR /app
COPY package*.json ./
RUN npm install
COPY . .
RUN npm run build || echo "No build script found"
ENV PORT={{ port }}
EXPOSE {{ port }}
CMD ["npm", "start"]
"#;

const PYTHON_TEMPLATE: &str = r#"FROM python:3.11-slim
WORKDIR /app
COPY requirements.txt* ./
RUN pip install --no-cache-dir -r requirements.txt || pip install flask
COPY . .
ENV PORT={{ port }}
EXPOSE {{ port }}
CMD ["python", "app.py"]
"#;

const GO_TEMPLATE: &str = r#"FROM golang:1.22-alpine AS build
WORKDIR /src
COPY go.* ./
RUN go mod download
COPY . .
RUN go build -o /bin/app .

FROM alpine:3.20
COPY --from=build /bin/app /bin/app
ENV PORT={{ port }}
EXPOSE {{ port }}
CMD ["/bin/app"]
"#;

const STATIC_TEMPLATE: &str = r#"FROM nginx:alpine
COPY . /usr/share/nginx/html
RUN sed -i 's/listen  *80;/listen {{ port }};/' /etc/nginx/conf.d/default.conf
EXPOSE {{ port }}
CMD ["nginx", "-g", "daemon off;"]
"#;

const FULLSTACK_TEMPLATE: &str = r#"FROM node:20-alpine AS frontend
WORKDIR /app
COPY package*.json ./
RUN npm install
COPY . .
RUN npm run build

FROM python:3.11-slim
WORKDIR /app
RUN apt-get update && apt-get install -y --no-install-recommends nodejs npm \
    && rm -rf /var/lib/apt/lists/*
COPY --from=frontend /app ./
COPY api ./api
RUN pip install --no-cache-dir -r api/requirements.txt || true
RUN printf '#!/bin/sh\ncd /app/api && uvicorn main:app --host 127.0.0.1 --port 8000 &\ncd /app && npm start\n' > /app/start.sh \
    && chmod +x /app/start.sh
ENV PORT={{ port }}
EXPOSE {{ port }}
CMD ["/app/start.sh"]
"#;

/// Render the Dockerfile for a detected project kind. `Dockerfile`
/// repositories are built as-is and never reach this function.
pub fn render_dockerfile(kind: ProjectKind, port: u16) -> Result<String, minijinja::Error> {
    let template = match kind {
        ProjectKind::Fullstack => FULLSTACK_TEMPLATE,
        ProjectKind::Node => NODE_TEMPLATE,
        ProjectKind::Python => PYTHON_TEMPLATE,
        ProjectKind::Go => GO_TEMPLATE,
        ProjectKind::Dockerfile | ProjectKind::Static => STATIC_TEMPLATE,
    };
    let env = Environment::new();
    let template = env.template_from_str(template)?;
    template.render(context! { port })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn scratch_repo(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("slipway-repo-{tag}-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn sniffs_each_manifest_kind() {
        let dir = scratch_repo("node");
        fs::write(dir.join("package.json"), "{}").unwrap();
        assert_eq!(detect_project_kind(&dir), ProjectKind::Node);
        fs::create_dir(dir.join("api")).unwrap();
        assert_eq!(detect_project_kind(&dir), ProjectKind::Fullstack);
        let _ = fs::remove_dir_all(&dir);

        let dir = scratch_repo("python");
        fs::write(dir.join("pyproject.toml"), "").unwrap();
        assert_eq!(detect_project_kind(&dir), ProjectKind::Python);
        let _ = fs::remove_dir_all(&dir);

        let dir = scratch_repo("go");
        fs::write(dir.join("go.mod"), "module demo").unwrap();
        assert_eq!(detect_project_kind(&dir), ProjectKind::Go);
        let _ = fs::remove_dir_all(&dir);

        let dir = scratch_repo("docker");
        fs::write(dir.join("Dockerfile"), "FROM scratch").unwrap();
        assert_eq!(detect_project_kind(&dir), ProjectKind::Dockerfile);
        let _ = fs::remove_dir_all(&dir);

        let dir = scratch_repo("static");
        fs::write(dir.join("index.html"), "<html/>").unwrap();
        assert_eq!(detect_project_kind(&dir), ProjectKind::Static);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn framework_manifest_wins_over_dockerfile() {
        let dir = scratch_repo("both");
        fs::write(dir.join("package.json"), "{}").unwrap();
        fs::write(dir.join("Dockerfile"), "FROM scratch").unwrap();
        assert_eq!(detect_project_kind(&dir), ProjectKind::Node);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn rendered_dockerfile_targets_the_port() {
        for kind in [
            ProjectKind::Node,
            ProjectKind::Python,
            ProjectKind::Go,
            ProjectKind::Static,
            ProjectKind::Fullstack,
        ] {
            let rendered = render_dockerfile(kind, 3123).expect("Failed to render");
            assert!(rendered.contains("EXPOSE 3123"), "{kind} misses the port");
        }
    }
}
