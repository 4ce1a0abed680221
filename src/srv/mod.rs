mod proxy;
mod router;
mod server;
mod tiles;

pub use router::{layers_from_query, route, PathError, RoutedRequest};
pub use server::{new_servers, router as configure_routes, PortRole, ServerContext};
pub use tiles::serve_tile;
