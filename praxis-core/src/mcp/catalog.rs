//! Namespaced capability catalog merged across every attached server.
//!
//! Entries are keyed `server.local_name` (resources by `server.uri`). A
//! lookup first tries to peel a known-server prefix off the name; failing
//! that it searches the bare name across all servers, and refuses to guess
//! when more than one server advertises it.

use std::collections::HashMap;

use crate::error::McpError;
use crate::mcp::transport::{Discovery, PromptDescriptor, ResourceDescriptor, ToolDescriptor};

pub const NAMESPACE_SEP: char = '.';

pub fn namespaced(server: &str, local: &str) -> String {
    format!("{server}{NAMESPACE_SEP}{local}")
}

/// Where a namespaced lookup landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub server: String,
    pub local_name: String,
}

#[derive(Debug, Clone)]
pub struct CatalogEntry<T> {
    pub server: String,
    pub local_name: String,
    pub descriptor: T,
}

#[derive(Debug, Default)]
pub struct Catalog {
    tools: HashMap<String, CatalogEntry<ToolDescriptor>>,
    resources: HashMap<String, CatalogEntry<ResourceDescriptor>>,
    prompts: HashMap<String, CatalogEntry<PromptDescriptor>>,
}

impl Catalog {
    /// Replace every entry for `server` with the given discovery snapshot.
    pub fn merge_server(&mut self, server: &str, discovery: &Discovery) {
        self.remove_server(server);
        for tool in &discovery.tools {
            self.tools.insert(
                namespaced(server, &tool.name),
                CatalogEntry {
                    server: server.to_string(),
                    local_name: tool.name.clone(),
                    descriptor: tool.clone(),
                },
            );
        }
        for resource in &discovery.resources {
            self.resources.insert(
                namespaced(server, &resource.uri),
                CatalogEntry {
                    server: server.to_string(),
                    local_name: resource.uri.clone(),
                    descriptor: resource.clone(),
                },
            );
        }
        for prompt in &discovery.prompts {
            self.prompts.insert(
                namespaced(server, &prompt.name),
                CatalogEntry {
                    server: server.to_string(),
                    local_name: prompt.name.clone(),
                    descriptor: prompt.clone(),
                },
            );
        }
    }

    pub fn remove_server(&mut self, server: &str) {
        self.tools.retain(|_, e| e.server != server);
        self.resources.retain(|_, e| e.server != server);
        self.prompts.retain(|_, e| e.server != server);
    }

    /// Namespaced tool list, sorted by name for stable output.
    pub fn tools(&self) -> Vec<(String, CatalogEntry<ToolDescriptor>)> {
        let mut out: Vec<_> = self
            .tools
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn resources(&self) -> Vec<(String, CatalogEntry<ResourceDescriptor>)> {
        let mut out: Vec<_> = self
            .resources
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn prompts(&self) -> Vec<(String, CatalogEntry<PromptDescriptor>)> {
        let mut out: Vec<_> = self
            .prompts
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn tool_descriptor(&self, route: &Route) -> Option<&ToolDescriptor> {
        self.tools
            .get(&namespaced(&route.server, &route.local_name))
            .map(|e| &e.descriptor)
    }

    /// Resolve a possibly-namespaced tool name. A prefix naming an attached
    /// server always routes there, even for tools missing from the catalog
    /// (servers may expose tools lazily); the downstream call surfaces any
    /// miss. A bare name must match exactly one server.
    pub fn resolve_tool(
        &self,
        name: &str,
        is_server: impl Fn(&str) -> bool,
    ) -> Result<Route, McpError> {
        if let Some((prefix, local)) = name.split_once(NAMESPACE_SEP) {
            if is_server(prefix) && !local.is_empty() {
                return Ok(Route {
                    server: prefix.to_string(),
                    local_name: local.to_string(),
                });
            }
        }
        let mut matches: Vec<&CatalogEntry<ToolDescriptor>> = self
            .tools
            .values()
            .filter(|e| e.local_name == name)
            .collect();
        matches.sort_by(|a, b| a.server.cmp(&b.server));
        match matches.len() {
            0 => Err(McpError::UnknownTool {
                name: name.to_string(),
            }),
            1 => Ok(Route {
                server: matches[0].server.clone(),
                local_name: matches[0].local_name.clone(),
            }),
            _ => Err(McpError::AmbiguousTool {
                name: name.to_string(),
                servers: matches.iter().map(|e| e.server.clone()).collect(),
            }),
        }
    }

    pub fn resolve_resource(
        &self,
        uri: &str,
        is_server: impl Fn(&str) -> bool,
    ) -> Result<Route, McpError> {
        if let Some((prefix, local)) = uri.split_once(NAMESPACE_SEP) {
            if is_server(prefix) && !local.is_empty() {
                return Ok(Route {
                    server: prefix.to_string(),
                    local_name: local.to_string(),
                });
            }
        }
        let mut matches: Vec<&CatalogEntry<ResourceDescriptor>> = self
            .resources
            .values()
            .filter(|e| e.local_name == uri)
            .collect();
        matches.sort_by(|a, b| a.server.cmp(&b.server));
        match matches.len() {
            0 => Err(McpError::UnknownResource {
                uri: uri.to_string(),
            }),
            1 => Ok(Route {
                server: matches[0].server.clone(),
                local_name: matches[0].local_name.clone(),
            }),
            _ => Err(McpError::AmbiguousResource {
                uri: uri.to_string(),
                servers: matches.iter().map(|e| e.server.clone()).collect(),
            }),
        }
    }

    pub fn resolve_prompt(
        &self,
        name: &str,
        is_server: impl Fn(&str) -> bool,
    ) -> Result<Route, McpError> {
        if let Some((prefix, local)) = name.split_once(NAMESPACE_SEP) {
            if is_server(prefix) && !local.is_empty() {
                return Ok(Route {
                    server: prefix.to_string(),
                    local_name: local.to_string(),
                });
            }
        }
        let mut matches: Vec<&CatalogEntry<PromptDescriptor>> = self
            .prompts
            .values()
            .filter(|e| e.local_name == name)
            .collect();
        matches.sort_by(|a, b| a.server.cmp(&b.server));
        match matches.len() {
            0 => Err(McpError::UnknownPrompt {
                name: name.to_string(),
            }),
            1 => Ok(Route {
                server: matches[0].server.clone(),
                local_name: matches[0].local_name.clone(),
            }),
            _ => Err(McpError::AmbiguousPrompt {
                name: name.to_string(),
                servers: matches.iter().map(|e| e.server.clone()).collect(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::testing::{discovery_with_tools, prompt, resource};
    use crate::mcp::transport::Discovery;

    fn two_server_catalog() -> Catalog {
        let mut catalog = Catalog::default();
        catalog.merge_server("docs", &discovery_with_tools(&["search", "fetch"]));
        catalog.merge_server("code", &discovery_with_tools(&["search", "lint"]));
        catalog
    }

    fn is_server(name: &str) -> bool {
        name == "docs" || name == "code"
    }

    #[test]
    fn merged_listing_is_namespaced_and_sorted() {
        let catalog = two_server_catalog();
        let names: Vec<String> = catalog.tools().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec!["code.lint", "code.search", "docs.fetch", "docs.search"]
        );
    }

    #[test]
    fn namespaced_name_routes_to_its_server() {
        let catalog = two_server_catalog();
        let route = catalog.resolve_tool("docs.search", is_server).unwrap();
        assert_eq!(route.server, "docs");
        assert_eq!(route.local_name, "search");
    }

    #[test]
    fn known_server_prefix_routes_even_without_catalog_entry() {
        let catalog = two_server_catalog();
        let route = catalog.resolve_tool("docs.not_yet_listed", is_server).unwrap();
        assert_eq!(route.server, "docs");
        assert_eq!(route.local_name, "not_yet_listed");
    }

    #[test]
    fn bare_name_falls_back_to_unique_owner() {
        let catalog = two_server_catalog();
        let route = catalog.resolve_tool("lint", is_server).unwrap();
        assert_eq!(route.server, "code");
        assert_eq!(route.local_name, "lint");
    }

    #[test]
    fn ambiguous_bare_name_is_a_hard_error() {
        let catalog = two_server_catalog();
        let err = catalog.resolve_tool("search", is_server).unwrap_err();
        match err {
            McpError::AmbiguousTool { name, servers } => {
                assert_eq!(name, "search");
                assert_eq!(servers, vec!["code", "docs"]);
            }
            other => panic!("expected AmbiguousTool, got {other:?}"),
        }
    }

    #[test]
    fn unknown_name_is_reported() {
        let catalog = two_server_catalog();
        assert!(matches!(
            catalog.resolve_tool("missing", is_server),
            Err(McpError::UnknownTool { .. })
        ));
    }

    #[test]
    fn dotted_local_name_survives_when_prefix_is_not_a_server() {
        let mut catalog = Catalog::default();
        catalog.merge_server("docs", &discovery_with_tools(&["fs.read"]));
        let route = catalog.resolve_tool("fs.read", is_server).unwrap();
        assert_eq!(route.server, "docs");
        assert_eq!(route.local_name, "fs.read");
    }

    #[test]
    fn remove_server_drops_only_its_entries() {
        let mut catalog = two_server_catalog();
        catalog.remove_server("docs");
        let names: Vec<String> = catalog.tools().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["code.lint", "code.search"]);
    }

    #[test]
    fn merge_replaces_previous_snapshot() {
        let mut catalog = two_server_catalog();
        catalog.merge_server("docs", &discovery_with_tools(&["fetch"]));
        assert!(catalog.resolve_tool("docs.search", is_server).is_ok());
        // Bare lookup of the dropped tool no longer finds docs.
        let route = catalog.resolve_tool("search", is_server).unwrap();
        assert_eq!(route.server, "code");
    }

    #[test]
    fn resources_and_prompts_use_the_same_discipline() {
        let mut catalog = Catalog::default();
        let discovery = Discovery {
            resources: vec![resource("file:///readme")],
            prompts: vec![prompt("summarize")],
            ..Default::default()
        };
        catalog.merge_server("docs", &discovery);
        catalog.merge_server("code", &discovery);

        let route = catalog
            .resolve_resource("docs.file:///readme", is_server)
            .unwrap();
        assert_eq!(route.local_name, "file:///readme");
        assert!(matches!(
            catalog.resolve_resource("file:///readme", is_server),
            Err(McpError::AmbiguousResource { .. })
        ));
        assert!(matches!(
            catalog.resolve_prompt("summarize", is_server),
            Err(McpError::AmbiguousPrompt { .. })
        ));
        let route = catalog.resolve_prompt("code.summarize", is_server).unwrap();
        assert_eq!(route.server, "code");
    }
}
