pub mod ctable;
pub mod link;
pub mod packet;
pub mod reassembly;
pub mod wall;
pub mod wire;

pub use ctable::{AddMode, CTable, CTableParams, LookupStreamer, Record, TableError};
pub use link::{LINK_CAPACITY, Link};
pub use packet::{HEADROOM, MAX_PAYLOAD, Packet, PacketPool};
pub use reassembly::{FragmentKey, Reassembler, ReassemblyStats, ReassemblyStatus};
pub use wall::{Classifier, Ipv4Prefix, ScanSuppressor, Verdict, WallConfig, WallStats};
