//! Dotted-path call sugar.
//!
//! `client.proxy().attr("a").attr("b").attr("value").invoke(args)` is
//! equivalent to calling `"a.b.value"` directly. The proxy never consults
//! the service: every path is syntactically valid and service-side
//! namespaces stay transparent.

use crate::client::{CallOptions, CallReply, Client};
use crate::error::Result;
use crate::serializer::{Kwargs, Value};

/// A remote attribute path bound to a client.
#[derive(Clone)]
pub struct RemoteProxy<'a> {
    client: &'a Client,
    path: String,
}

impl<'a> RemoteProxy<'a> {
    pub(crate) fn root(client: &'a Client) -> Self {
        RemoteProxy {
            client,
            path: String::new(),
        }
    }

    pub(crate) fn at(client: &'a Client, path: &str) -> Self {
        RemoteProxy {
            client,
            path: path.to_string(),
        }
    }

    /// Extend the path by one attribute.
    pub fn attr(&self, name: &str) -> RemoteProxy<'a> {
        let path = if self.path.is_empty() {
            name.to_string()
        } else {
            format!("{}.{name}", self.path)
        };
        RemoteProxy {
            client: self.client,
            path,
        }
    }

    /// The dotted procedure name this proxy resolves to.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Invoke with positional arguments and wait for the value.
    pub async fn invoke(&self, args: Vec<Value>) -> Result<Value> {
        self.client.invoke(&self.path, args).await
    }

    /// Invoke with positional and keyword arguments.
    pub async fn invoke_kw(&self, args: Vec<Value>, kwargs: Kwargs) -> Result<Value> {
        self.client
            .call(&self.path, args, kwargs, CallOptions::default())
            .await?
            .into_value()
    }

    /// Full-control invocation, e.g. for streams, timeouts or ignore mode.
    pub async fn call(
        &self,
        args: Vec<Value>,
        kwargs: Kwargs,
        options: CallOptions,
    ) -> Result<CallReply> {
        self.client.call(&self.path, args, kwargs, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;

    #[tokio::test]
    async fn paths_accumulate_with_dots() {
        let client = Client::new(zmq::Context::new(), ClientConfig::default());
        let proxy = client.proxy().attr("a").attr("b").attr("value");
        assert_eq!(proxy.path(), "a.b.value");
        client.shutdown();
    }
}
