mod direct;
mod discovering;
mod replica_set;
mod selection;
mod sharded;
