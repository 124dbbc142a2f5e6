use std::fmt;

use super::config::{Config, OperationAttrs};

impl<A: OperationAttrs> fmt::Display for Config<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for desc in self.descs.src.iter().chain(&self.descs.dst) {
            write!(f, "{desc};")?;
        }
        f.write_str("post_ops[")?;
        for (idx, op) in self.post_ops.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            write!(f, "{op}")?;
        }
        write!(f, "];{}", self.attrs)
    }
}
