// Copyright 2016 Mozilla Foundation
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! One concrete [`crate::blob::storage::Storage`] backend: an S3-compatible
//! bucket, signed the AWS SigV2 way. Kept from the teacher almost
//! unmodified in shape (`Bucket::get`/`Bucket::put` plus the `auth`
//! canonical-string signer); modernized from hyper 0.1 futures/`rust-crypto`
//! to `reqwest`/`hmac`/`sha1`.

pub mod s3;

use async_trait::async_trait;

use crate::errors::{ProxyError, Result};

/// Static AWS-style credentials. The proxy never does STS/IAM role
/// assumption; an access key and secret are supplied via config (spec.md
/// §6 treats the remote backend as an opaque endpoint + credential pair).
#[derive(Clone)]
pub struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    token: Option<String>,
}

impl AwsCredentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>, token: Option<String>) -> Self {
        AwsCredentials {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            token,
        }
    }

    pub fn aws_access_key_id(&self) -> &str {
        &self.access_key_id
    }

    pub fn aws_secret_access_key(&self) -> &str {
        &self.secret_access_key
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}

/// Adapts [`s3::Bucket`] to the generic [`crate::blob::storage::Storage`]
/// trait C3 dispatches through.
pub struct S3Storage {
    bucket: s3::Bucket,
    credentials: AwsCredentials,
}

impl S3Storage {
    pub fn new(bucket: s3::Bucket, credentials: AwsCredentials) -> Self {
        S3Storage { bucket, credentials }
    }
}

#[async_trait]
impl crate::blob::storage::Storage for S3Storage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.bucket.get(key).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(ProxyError::Rpc(msg)) if msg.contains("404") => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.bucket.put(key, data, self.credentials.clone()).await
    }
}
