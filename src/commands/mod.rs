pub mod clusters;
pub mod kubeconfig;
pub mod proxy;
