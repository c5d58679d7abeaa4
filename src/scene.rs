//! Demo scene selection from the command line.

use anyhow::{bail, Result};

use crate::config::AssetConfig;
use crate::mesh::Mesh;

pub const USAGE: &str = "usage: room-viewer-vk [--quads]";

/// Which geometry is drawn. Both scenes sample the configured texture.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Scene {
    /// The OBJ model from the configured asset path.
    #[default]
    Room,
    /// Two depth-separated quads built in code.
    Quads,
}

impl Scene {
    /// Parses command line arguments, excluding the program name.
    pub fn from_args<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut scene = Scene::Room;
        for arg in args {
            match arg.as_ref() {
                "--quads" => scene = Scene::Quads,
                other => bail!("unrecognized argument `{}`\n{}", other, USAGE),
            }
        }
        Ok(scene)
    }

    pub fn load_mesh(self, assets: &AssetConfig) -> Result<Mesh> {
        match self {
            Scene::Room => Mesh::from_obj(&assets.model),
            Scene::Quads => Ok(Mesh::quads()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_arguments_selects_room() {
        assert_eq!(Scene::from_args(Vec::<String>::new()).unwrap(), Scene::Room);
    }

    #[test]
    fn quads_flag() {
        assert_eq!(Scene::from_args(["--quads"]).unwrap(), Scene::Quads);
    }

    #[test]
    fn unknown_flag_reports_usage() {
        let error = Scene::from_args(["--cube"]).unwrap_err().to_string();
        assert!(error.contains("--cube"));
        assert!(error.contains(USAGE));
    }

    #[test]
    fn quads_scene_needs_no_files() {
        let assets = AssetConfig {
            model: "does/not/exist.obj".into(),
            ..Default::default()
        };
        let mesh = Scene::Quads.load_mesh(&assets).unwrap();
        assert_eq!(mesh.indices.len(), 12);
        assert!(Scene::Room.load_mesh(&assets).is_err());
    }
}
