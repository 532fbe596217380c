//! Protobuf bindings, trimmed to the session and transaction RPCs this crate
//! calls. The generated sources are checked in under `src/generated/` so that
//! builds do not need `protoc` or a vendored googleapis proto tree.

pub mod google {
    pub mod rpc {
        #![allow(clippy::all)]
        include!("generated/google.rpc.rs");
    }
    pub mod spanner {
        pub mod v1 {
            #![allow(clippy::all)]
            include!("generated/google.spanner.v1.rs");
        }
    }
}
