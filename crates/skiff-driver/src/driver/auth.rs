use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::Interceptor;
use tonic::{Request, Status};

use crate::error::{DriverError, DriverResult};

pub(crate) const CLIENT_ID_HEADER: &str = "x-skiff-client-id";
pub(crate) const SECRET_HEADER: &str = "x-skiff-secret";

/// Validates the client identity and shared secret carried in request
/// metadata. The same credentials are attached to outbound callback calls.
#[derive(Clone)]
pub struct AuthInterceptor {
    client_id: MetadataValue<Ascii>,
    secret: MetadataValue<Ascii>,
}

impl AuthInterceptor {
    pub fn new(client_id: &str, secret: &str) -> DriverResult<Self> {
        let client_id = client_id
            .parse()
            .map_err(|_| DriverError::InvalidArgument("invalid client ID".to_string()))?;
        let secret = secret
            .parse()
            .map_err(|_| DriverError::InvalidArgument("invalid secret".to_string()))?;
        Ok(Self { client_id, secret })
    }

    pub(crate) fn client_id(&self) -> &MetadataValue<Ascii> {
        &self.client_id
    }

    pub(crate) fn secret(&self) -> &MetadataValue<Ascii> {
        &self.secret
    }
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, request: Request<()>) -> Result<Request<()>, Status> {
        let authenticated = request.metadata().get(CLIENT_ID_HEADER) == Some(&self.client_id)
            && request.metadata().get(SECRET_HEADER) == Some(&self.secret);
        if authenticated {
            Ok(request)
        } else {
            Err(Status::unauthenticated("invalid client credentials"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_missing_credentials() {
        let mut interceptor = AuthInterceptor::new("client-1", "secret").unwrap();
        let request = Request::new(());
        assert!(interceptor.call(request).is_err());
    }

    #[test]
    fn test_accepts_valid_credentials() {
        let mut interceptor = AuthInterceptor::new("client-1", "secret").unwrap();
        let mut request = Request::new(());
        request
            .metadata_mut()
            .insert(CLIENT_ID_HEADER, "client-1".parse().unwrap());
        request
            .metadata_mut()
            .insert(SECRET_HEADER, "secret".parse().unwrap());
        assert!(interceptor.call(request).is_ok());
    }

    #[test]
    fn test_rejects_wrong_secret() {
        let mut interceptor = AuthInterceptor::new("client-1", "secret").unwrap();
        let mut request = Request::new(());
        request
            .metadata_mut()
            .insert(CLIENT_ID_HEADER, "client-1".parse().unwrap());
        request
            .metadata_mut()
            .insert(SECRET_HEADER, "wrong".parse().unwrap());
        assert!(interceptor.call(request).is_err());
    }
}
