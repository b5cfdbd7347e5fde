//! # Lifecycle Flows
//!
//! End-to-end runs through the RPC surface:
//!
//! 1. **MSContract → VPC → payment → mutual close → settle**
//! 2. **Missed confirmation → refund**
//! 3. **Propose/respond over the event log**
//! 4. **Dispute close with response window**
//! 5. **Adapter failure reported to both participants**
