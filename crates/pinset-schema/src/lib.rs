//! Data model and file formats for pinset.
//!
//! This crate defines the schema layer: the resolved input `Manifest` and its
//! `Source` variants, the structured records a dependency manifest parses into
//! (`DepsFile`), ensure files and their resolved-versions lock files, platform
//! template expansion for package names, and virtualenv spec records.

pub mod deps;
pub mod ensure;
pub mod manifest;
pub mod template;
pub mod types;
pub mod venv;

pub use deps::{DepsError, DepsFile, GcsDep, GcsDepObject, GitDep, GnArgs, Hook, PackageDef, RecurseDep};
pub use ensure::{EnsureError, EnsureFile, VersionsFile};
pub use manifest::{
    ArchiveFormat, ArchiveSource, BlobHash, BlobObject, GitSource, GlobalVariables, Manifest,
    ManifestError, PackageSource, PinnedPackage, RawSource, Source, SystemDeps, VarValue,
    VersionPair, VirtualEnv, PROVENANCE_GIT_REMOTE, PROVENANCE_PIN,
};
pub use template::{expand_template, Platform, TemplateError};
pub use types::{is_full_commit_hash, is_instance_id, is_short_commit_hash, SpecHash};
pub use venv::{VenvSpec, VenvSpecError, WheelRequirement};
