mod convert;
mod server;
mod transport;

pub use convert::{
    WorkspaceEdit, normalize_workspace_edit, parse_locations, path_to_uri,
    symbol_tree_from_response, uri_to_path,
};
pub use server::{FileSymbols, LanguageServer, LanguageServerOptions, ServerState};
pub use transport::{
    NotificationHandler, ServerRequestPolicy, Transport, TransportOptions,
    default_server_request_policy, read_frame, write_frame,
};
