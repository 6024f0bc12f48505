//! Path parsing for the `/v2/` namespace.
//!
//! Repository names contain slashes, so the router cannot split these paths
//! with ordinary segment captures.

/// A request target below `/v2/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Route {
    /// `/v2/{name}/blobs/{digest}`
    Blob { name: String, digest: String },

    /// `/v2/{name}/blobs/uploads/`
    Uploads { name: String },

    /// `/v2/{name}/blobs/uploads/{id}`
    Upload { name: String, id: String },

    /// `/v2/{name}/manifests/{reference}`
    Manifest { name: String, reference: String },
}

fn split<'a>(rest: &'a str, separator: &str) -> Option<(&'a str, &'a str)> {
    let (name, last) = rest.rsplit_once(separator)?;
    if name.is_empty() || last.is_empty() || last.contains('/') {
        return None;
    }
    Some((name, last))
}

impl Route {
    /// Parse the part of the path after `/v2/`.
    pub(crate) fn parse(rest: &str) -> Option<Route> {
        let rest = rest.strip_prefix('/').unwrap_or(rest);

        if let Some(name) = rest
            .strip_suffix("/blobs/uploads/")
            .or_else(|| rest.strip_suffix("/blobs/uploads"))
        {
            return (!name.is_empty()).then(|| Route::Uploads {
                name: name.to_owned(),
            });
        }

        if let Some((name, id)) = split(rest, "/blobs/uploads/") {
            return Some(Route::Upload {
                name: name.to_owned(),
                id: id.to_owned(),
            });
        }

        if let Some((name, reference)) = split(rest, "/manifests/") {
            return Some(Route::Manifest {
                name: name.to_owned(),
                reference: reference.to_owned(),
            });
        }

        split(rest, "/blobs/").map(|(name, digest)| Route::Blob {
            name: name.to_owned(),
            digest: digest.to_owned(),
        })
    }

    /// The repository the request addresses.
    pub(crate) fn repository(&self) -> &str {
        match self {
            Route::Blob { name, .. }
            | Route::Uploads { name }
            | Route::Upload { name, .. }
            | Route::Manifest { name, .. } => name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_repository_names() {
        assert_eq!(
            Route::parse("library/ubuntu/manifests/latest"),
            Some(Route::Manifest {
                name: "library/ubuntu".into(),
                reference: "latest".into(),
            })
        );
        assert_eq!(
            Route::parse("a/b/c/blobs/sha256:abc"),
            Some(Route::Blob {
                name: "a/b/c".into(),
                digest: "sha256:abc".into(),
            })
        );
    }

    #[test]
    fn upload_paths() {
        let uploads = Some(Route::Uploads {
            name: "acme".into(),
        });
        assert_eq!(Route::parse("acme/blobs/uploads/"), uploads);
        assert_eq!(Route::parse("acme/blobs/uploads"), uploads);
        assert_eq!(
            Route::parse("acme/blobs/uploads/1234"),
            Some(Route::Upload {
                name: "acme".into(),
                id: "1234".into(),
            })
        );
    }

    #[test]
    fn unknown_paths() {
        for path in ["", "acme", "acme/tags/list", "/blobs/x", "acme/blobs/", "blobs/uploads/"] {
            assert_eq!(Route::parse(path), None, "{path}");
        }
    }

    #[test]
    fn repository_accessor() {
        let route = Route::parse("org/app/blobs/uploads/").unwrap();
        assert_eq!(route.repository(), "org/app");
    }
}
