use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Result, RpcError};
use crate::schema::{echo_service, FieldSchema, MethodSchema, ServiceSchema, MAX_FIELD_NUMBER};

/// File suffix picked up when a descriptor directory is scanned.
pub const DESCRIPTOR_SUFFIX: &str = ".rpc.json";

/// Limits applied while loading descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Maximum number of descriptor files loaded from one directory.
    pub max_descriptors_from_directory: usize,
    /// Maximum bytes allowed per descriptor file.
    pub max_descriptor_file_size: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_descriptors_from_directory: 256,
            max_descriptor_file_size: 256 * 1024,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DescriptorFile {
    #[serde(default)]
    package: String,
    services: Vec<ServiceDescriptor>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServiceDescriptor {
    name: String,
    methods: Vec<MethodDescriptor>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MethodDescriptor {
    name: String,
    #[serde(default)]
    request: Vec<FieldSchema>,
}

/// Services known to a transport, resolved by name.
///
/// Every registry starts with `pw.rpc.EchoService`. Descriptors loaded later
/// replace services with the same fully qualified name.
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    services: Vec<ServiceSchema>,
    default_package: Option<String>,
    config: RegistryConfig,
}

impl ServiceRegistry {
    /// Create a registry holding only the built-in services.
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a registry with explicit load limits.
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            services: vec![echo_service()],
            default_package: None,
            config,
        }
    }

    /// Load descriptors from files and directories.
    pub fn from_paths<P: AsRef<Path>>(paths: &[P], config: RegistryConfig) -> Result<Self> {
        let mut registry = Self::with_config(config);
        for path in paths {
            registry.load_path(path.as_ref())?;
        }
        Ok(registry)
    }

    /// Package tried first when a bare service name is looked up.
    pub fn set_default_package(&mut self, package: Option<String>) {
        self.default_package = package.filter(|p| !p.is_empty());
    }

    pub fn default_package(&self) -> Option<&str> {
        self.default_package.as_deref()
    }

    /// Add or replace a service.
    pub fn register(&mut self, service: ServiceSchema) {
        if let Some(existing) = self
            .services
            .iter_mut()
            .find(|s| s.full_name == service.full_name)
        {
            warn!(service = %service.full_name, "replacing previously registered service");
            *existing = service;
        } else {
            debug!(service = %service.full_name, id = service.id, "registered service");
            self.services.push(service);
        }
    }

    /// Register every service in a descriptor document.
    ///
    /// `source` only labels errors. Returns the number of services added.
    pub fn register_json(&mut self, json: &str, source: &Path) -> Result<usize> {
        let file: DescriptorFile =
            serde_json::from_str(json).map_err(|err| RpcError::InvalidDescriptor {
                path: source.to_path_buf(),
                message: err.to_string(),
            })?;
        let services = build_services(file, source)?;
        let count = services.len();
        for service in services {
            self.register(service);
        }
        Ok(count)
    }

    /// Load a descriptor file, or every `*.rpc.json` file in a directory.
    pub fn load_path(&mut self, path: &Path) -> Result<usize> {
        let metadata = std::fs::metadata(path)
            .map_err(|err| RpcError::LoadFailed(format!("{}: {err}", path.display())))?;
        if metadata.is_dir() {
            self.load_directory(path)
        } else {
            let content = read_capped(path, self.config.max_descriptor_file_size)?;
            self.register_json(&content, path)
        }
    }

    /// Load every `*.rpc.json` file in a directory, in name order.
    pub fn load_directory(&mut self, path: &Path) -> Result<usize> {
        let entries = std::fs::read_dir(path)
            .map_err(|err| RpcError::LoadFailed(format!("{}: {err}", path.display())))?;

        let mut candidates: Vec<PathBuf> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| RpcError::LoadFailed(err.to_string()))?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if !file_name.ends_with(DESCRIPTOR_SUFFIX) {
                continue;
            }

            let entry_path = entry.path();
            let file_type = std::fs::symlink_metadata(&entry_path)
                .map_err(|err| RpcError::LoadFailed(err.to_string()))?
                .file_type();
            if file_type.is_symlink() {
                return Err(RpcError::LoadFailed(format!(
                    "refusing to load descriptor symlink: {file_name}"
                )));
            }
            if !file_type.is_file() {
                continue;
            }

            candidates.push(entry_path);
            if candidates.len() > self.config.max_descriptors_from_directory {
                return Err(RpcError::LoadFailed(format!(
                    "descriptor count exceeds configured max ({}) in {}",
                    self.config.max_descriptors_from_directory,
                    path.display()
                )));
            }
        }
        candidates.sort();

        let mut total = 0usize;
        for candidate in candidates {
            let content = read_capped(&candidate, self.config.max_descriptor_file_size)?;
            total += self.register_json(&content, &candidate)?;
        }
        debug!(dir = %path.display(), services = total, "loaded descriptor directory");
        Ok(total)
    }

    /// Resolve a service and method by name.
    ///
    /// The service may be given fully qualified, relative to the default
    /// package, or by bare name when that name is unique.
    pub fn resolve(&self, service: &str, method: &str) -> Result<(&ServiceSchema, &MethodSchema)> {
        let schema = self.service(service)?;
        let method_schema = schema
            .method(method)
            .ok_or_else(|| RpcError::UnknownMethod {
                service: schema.full_name.clone(),
                method: method.to_string(),
            })?;
        Ok((schema, method_schema))
    }

    /// Look up a service by name.
    pub fn service(&self, name: &str) -> Result<&ServiceSchema> {
        if let Some(found) = self.services.iter().find(|s| s.full_name == name) {
            return Ok(found);
        }

        if let Some(package) = &self.default_package {
            let qualified = format!("{package}.{name}");
            if let Some(found) = self.services.iter().find(|s| s.full_name == qualified) {
                return Ok(found);
            }
        }

        let mut matches = self.services.iter().filter(|s| s.name == name);
        match (matches.next(), matches.next()) {
            (Some(found), None) => Ok(found),
            (Some(first), Some(second)) => {
                let mut candidates = vec![first.full_name.clone(), second.full_name.clone()];
                candidates.extend(matches.map(|s| s.full_name.clone()));
                Err(RpcError::AmbiguousService {
                    service: name.to_string(),
                    candidates,
                })
            }
            (None, _) => Err(RpcError::UnknownService(name.to_string())),
        }
    }

    /// All registered services, in registration order.
    pub fn services(&self) -> &[ServiceSchema] {
        &self.services
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn build_services(file: DescriptorFile, source: &Path) -> Result<Vec<ServiceSchema>> {
    let invalid = |message: String| RpcError::InvalidDescriptor {
        path: source.to_path_buf(),
        message,
    };

    let mut services = Vec::with_capacity(file.services.len());
    let mut service_names = HashSet::new();
    for service in file.services {
        if !is_identifier(&service.name) {
            return Err(invalid(format!("invalid service name '{}'", service.name)));
        }
        if !service_names.insert(service.name.clone()) {
            return Err(invalid(format!("duplicate service '{}'", service.name)));
        }

        let mut methods: Vec<MethodSchema> = Vec::with_capacity(service.methods.len());
        for method in service.methods {
            if !is_identifier(&method.name) {
                return Err(invalid(format!(
                    "invalid method name '{}.{}'",
                    service.name, method.name
                )));
            }
            validate_fields(&method.request)
                .map_err(|msg| invalid(format!("{}.{}: {msg}", service.name, method.name)))?;

            let schema = MethodSchema::new(method.name, method.request);
            if let Some(clash) = methods.iter().find(|m| m.id == schema.id) {
                return Err(invalid(format!(
                    "methods '{}' and '{}' of {} hash to the same id",
                    clash.name, schema.name, service.name
                )));
            }
            methods.push(schema);
        }

        services.push(ServiceSchema::new(&file.package, service.name, methods));
    }
    Ok(services)
}

fn validate_fields(fields: &[FieldSchema]) -> std::result::Result<(), String> {
    let mut names = HashSet::new();
    let mut numbers = HashSet::new();
    for field in fields {
        if !is_identifier(&field.name) {
            return Err(format!("invalid field name '{}'", field.name));
        }
        if field.number == 0 || field.number > MAX_FIELD_NUMBER {
            return Err(format!(
                "field '{}' has out-of-range number {}",
                field.name, field.number
            ));
        }
        if !names.insert(field.name.as_str()) {
            return Err(format!("duplicate field name '{}'", field.name));
        }
        if !numbers.insert(field.number) {
            return Err(format!("duplicate field number {}", field.number));
        }
    }
    Ok(())
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn read_capped(path: &Path, max_bytes: usize) -> Result<String> {
    let path_metadata = std::fs::symlink_metadata(path)
        .map_err(|err| RpcError::LoadFailed(format!("{}: {err}", path.display())))?;

    let file = std::fs::File::open(path).map_err(|err| {
        RpcError::LoadFailed(format!(
            "failed opening descriptor {}: {err}",
            path.display()
        ))
    })?;
    let opened_metadata = file
        .metadata()
        .map_err(|err| RpcError::LoadFailed(err.to_string()))?;

    #[cfg(unix)]
    {
        if !path_metadata.file_type().is_symlink()
            && !same_file_identity(&path_metadata, &opened_metadata)
        {
            return Err(RpcError::LoadFailed(format!(
                "descriptor changed during load: {}",
                path.display()
            )));
        }
    }
    #[cfg(not(unix))]
    let _ = path_metadata;

    if opened_metadata.len() > max_bytes as u64 {
        return Err(RpcError::LoadFailed(format!(
            "descriptor too large ({} bytes): {}",
            opened_metadata.len(),
            path.display()
        )));
    }

    let read_limit = u64::try_from(max_bytes.saturating_add(1)).unwrap_or(u64::MAX);
    let mut content = String::new();
    file.take(read_limit)
        .read_to_string(&mut content)
        .map_err(|err| {
            RpcError::LoadFailed(format!(
                "failed reading descriptor {}: {err}",
                path.display()
            ))
        })?;
    if content.len() > max_bytes {
        return Err(RpcError::LoadFailed(format!(
            "descriptor too large while reading: {}",
            path.display()
        )));
    }
    Ok(content)
}

#[cfg(unix)]
fn same_file_identity(
    path_metadata: &std::fs::Metadata,
    opened_metadata: &std::fs::Metadata,
) -> bool {
    use std::os::unix::fs::MetadataExt;
    path_metadata.dev() == opened_metadata.dev() && path_metadata.ino() == opened_metadata.ino()
}
